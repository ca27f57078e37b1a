//! Cryptography errors.

use thiserror::Error;

/// Errors raised by the cryptographic primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A key could not be parsed or has the wrong length.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Ciphertext authentication or decoding failed.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// The session cannot decrypt this message index.
    #[error("Unknown message index {requested}, first known index {first_known}")]
    UnknownMessageIndex {
        /// First index the session can decrypt.
        first_known: u32,
        /// Index of the rejected message.
        requested: u32,
    },

    /// A pickle could not be decrypted or decoded.
    #[error("Pickle error: {0}")]
    Pickle(String),

    /// The operating system RNG failed.
    #[error("Random number generation failed: {0}")]
    Random(String),

    /// A MAC did not verify.
    #[error("MAC verification failed")]
    InvalidMac,

    /// An Ed25519 signature did not verify.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A recovery key was malformed.
    #[error("Invalid recovery key: {0}")]
    InvalidRecoveryKey(String),

    /// A passphrase did not unlock the wrapped key.
    #[error("Wrong passphrase or corrupted key material")]
    Passphrase,

    /// The payload uses a format version we do not understand.
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u32),

    /// The payload uses an algorithm we do not understand.
    #[error("Unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The payload is not well formed.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
