//! Ed25519 Signing
//!
//! Cross-signing keys and canonical-JSON signatures over key uploads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature};
use zeroize::Zeroizing;

use crate::{CryptoError, Result};

/// An Ed25519 private key used for cross-signing.
pub struct SigningKey {
    inner: Ed25519SecretKey,
}

impl SigningKey {
    /// Generate a fresh key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Ed25519SecretKey::new(),
        }
    }

    /// Public key (base64).
    #[must_use]
    pub fn public_key(&self) -> String {
        self.inner.public_key().to_base64()
    }

    /// Sign raw bytes, returning a base64 signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> String {
        self.inner.sign(message).to_base64()
    }

    /// Sign the canonical form of a JSON object.
    #[must_use]
    pub fn sign_json(&self, value: &Value) -> String {
        self.sign(canonical_json(value).as_bytes())
    }

    /// Export the private key bytes (base64).
    #[must_use]
    pub fn to_base64(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(*self.inner.to_bytes());
        Zeroizing::new(STANDARD.encode(bytes.as_slice()))
    }

    /// Import a key exported with [`Self::to_base64`].
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|e| CryptoError::InvalidKey(format!("Invalid signing key: {e}")))?,
        );
        let bytes: Zeroizing<[u8; 32]> = Zeroizing::new(
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("signing key must be 32 bytes".to_owned()))?,
        );
        Ok(Self {
            inner: Ed25519SecretKey::from_slice(&bytes),
        })
    }
}

impl Default for SigningKey {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        let bytes = Zeroizing::new(*self.inner.to_bytes());
        Self {
            inner: Ed25519SecretKey::from_slice(&bytes),
        }
    }
}

/// Verify a base64 signature over raw bytes.
pub fn verify_signature(public_key: &str, message: &[u8], signature: &str) -> Result<()> {
    let key = Ed25519PublicKey::from_base64(public_key)
        .map_err(|e| CryptoError::InvalidKey(format!("Invalid Ed25519 key: {e}")))?;
    let signature = Ed25519Signature::from_base64(signature)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    key.verify(message, &signature)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
}

/// Verify a base64 signature over the canonical form of a JSON object.
pub fn verify_json_signature(public_key: &str, value: &Value, signature: &str) -> Result<()> {
    verify_signature(public_key, canonical_json(value).as_bytes(), signature)
}

/// Canonical JSON: sorted keys, no insignificant whitespace, and the
/// `signatures` and `unsigned` fields of the top-level object removed.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Object(map) => {
            let stripped: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| k.as_str() != "signatures" && k.as_str() != "unsigned")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            write_canonical(&Value::Object(stripped), &mut out);
        }
        other => write_canonical(other, &mut out),
    }
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_canonical_json_sorts_and_strips() {
        let value = json!({
            "b": 1,
            "a": {"z": true, "y": [2, 1]},
            "signatures": {"@u:x": {}},
            "unsigned": {"age": 3}
        });
        assert_eq!(canonical_json(&value), r#"{"a":{"y":[2,1],"z":true},"b":1}"#);
    }

    #[test]
    fn test_json_signature_ignores_signatures_field() {
        let key = SigningKey::new();
        let mut value = json!({"user_id": "@alice:example.org", "keys": {"a": "b"}});
        let signature = key.sign_json(&value);

        value["signatures"] = json!({"@alice:example.org": {"ed25519:x": signature.clone()}});
        verify_json_signature(&key.public_key(), &value, &signature).unwrap();

        value["keys"]["a"] = json!("c");
        assert!(verify_json_signature(&key.public_key(), &value, &signature).is_err());
    }

    #[test]
    fn test_signing_key_export_roundtrip() {
        let key = SigningKey::new();
        let restored = SigningKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(restored.public_key(), key.public_key());
        assert_eq!(key.clone().public_key(), key.public_key());
    }
}
