//! Verification State Resolution
//!
//! Computes the trust tier of the device behind a decrypted event. The
//! result is recomputed from the store on every decryption, so a trust
//! change applies to the very next event.

use std::sync::Arc;

use e2ee_common::{DeviceId, UserId, VerificationState};
use tracing::warn;

use crate::identities::{Device, LocalTrust, UserIdentity};
use crate::store::{KeyStore, Result};

/// How the sender device of an event was found.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    /// The device.
    pub device: Device,
    /// Whether the event's sender key is one of the device's current keys.
    pub current_key: bool,
}

/// Resolves [`VerificationState`] against the key store.
pub struct VerificationResolver {
    store: Arc<dyn KeyStore>,
    own_user: UserId,
    own_device: DeviceId,
}

impl std::fmt::Debug for VerificationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationResolver")
            .field("own_user", &self.own_user)
            .field("own_device", &self.own_device)
            .finish_non_exhaustive()
    }
}

impl VerificationResolver {
    /// Create a resolver for our own `user`/`device`.
    pub fn new(store: Arc<dyn KeyStore>, own_user: UserId, own_device: DeviceId) -> Self {
        Self {
            store,
            own_user,
            own_device,
        }
    }

    /// Find the device that owns `sender_key`.
    ///
    /// Uses `device_id` when the envelope names one, otherwise scans the
    /// sender's devices for a current or rotated-out Curve25519 key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub async fn find_device(
        &self,
        sender: &UserId,
        device_id: Option<&DeviceId>,
        sender_key: &str,
    ) -> Result<Option<ResolvedDevice>> {
        if let Some(device_id) = device_id {
            return Ok(self
                .store
                .get_device(sender, device_id)
                .await?
                .map(|device| ResolvedDevice {
                    current_key: device.curve25519_key() == Some(sender_key),
                    device,
                }));
        }

        let devices = self.store.get_user_devices(sender).await?;
        let current = devices
            .values()
            .find(|device| device.curve25519_key() == Some(sender_key));
        if let Some(device) = current {
            return Ok(Some(ResolvedDevice {
                device: device.clone(),
                current_key: true,
            }));
        }

        Ok(devices
            .into_values()
            .find(|device| device.had_curve25519_key(sender_key))
            .map(|device| ResolvedDevice {
                device,
                current_key: false,
            }))
    }

    /// Trust tier of an event.
    ///
    /// `session_sender` is the user that shared the session, `sender_key`
    /// and `signing_key` the keys recorded on it, and `event_sender` the
    /// sender field of the event. Mismatched keys are never upgraded to
    /// [`VerificationState::Verified`].
    pub async fn resolve(
        &self,
        device: Option<&Device>,
        event_sender: &UserId,
        session_sender: &UserId,
        sender_key: &str,
        signing_key: &str,
    ) -> VerificationState {
        let Some(device) = device else {
            return VerificationState::UnknownDevice;
        };

        if let Some(state) = Self::key_state(device, event_sender, session_sender, sender_key, signing_key) {
            return state;
        }

        if device.deleted {
            return VerificationState::Unverified;
        }

        if device.user_id() == &self.own_user && device.device_id() == &self.own_device {
            return VerificationState::Verified;
        }

        match device.local_trust {
            LocalTrust::BlackListed => return VerificationState::Unverified,
            LocalTrust::Verified => return VerificationState::Verified,
            LocalTrust::Unset | LocalTrust::Ignored => {}
        }

        match self.is_cross_signed(device).await {
            Ok(true) => VerificationState::Verified,
            Ok(false) => VerificationState::Unverified,
            Err(e) => {
                warn!(error = %e, user_id = %device.user_id(), "Trust chain lookup failed");
                VerificationState::Unverified
            }
        }
    }

    /// The state forced by the event's keys alone, before trust is
    /// considered.
    ///
    /// `Some(MismatchedSender)` when the keys or sender do not belong to
    /// `device`, `Some(Unverified)` when they are keys the device rotated
    /// out, `None` when they are its current keys.
    #[must_use]
    pub fn key_state(
        device: &Device,
        event_sender: &UserId,
        session_sender: &UserId,
        sender_key: &str,
        signing_key: &str,
    ) -> Option<VerificationState> {
        if session_sender != event_sender || device.user_id() != event_sender {
            return Some(VerificationState::MismatchedSender);
        }

        let curve_matches = device.curve25519_key() == Some(sender_key);
        let ed_matches = device.ed25519_key() == Some(signing_key);
        if curve_matches && ed_matches {
            return None;
        }

        // Sessions from before a key rotation keep decrypting, untrusted.
        let rotated = (curve_matches || device.had_curve25519_key(sender_key))
            && (ed_matches || device.had_ed25519_key(signing_key));
        Some(if rotated {
            VerificationState::Unverified
        } else {
            VerificationState::MismatchedSender
        })
    }

    /// Whether `device` is reachable by an unbroken signature chain from
    /// our own master key, which must be backed by our private keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub async fn is_cross_signed(&self, device: &Device) -> Result<bool> {
        let Some(private) = self.store.load_private_identity().await? else {
            return Ok(false);
        };
        let Some(own) = self.store.get_user_identity(&self.own_user).await? else {
            return Ok(false);
        };
        if !private.matches(&own) || !own.is_consistent() {
            return Ok(false);
        }

        if device.user_id() == &self.own_user {
            return Ok(device.keys.is_signed_by(&own.self_signing_key));
        }

        let Some(theirs) = self.store.get_user_identity(device.user_id()).await? else {
            return Ok(false);
        };
        Ok(Self::user_is_trusted(&own, &theirs) && device.keys.is_signed_by(&theirs.self_signing_key))
    }

    /// Whether `theirs` is signed by our user-signing key and internally consistent.
    #[must_use]
    pub fn user_is_trusted(own: &UserIdentity, theirs: &UserIdentity) -> bool {
        let Some(user_signing) = own.user_signing_key.as_ref() else {
            return false;
        };
        user_signing.is_signed_by(&own.master_key)
            && theirs.master_key.is_signed_by(user_signing)
            && theirs.self_signing_key.is_signed_by(&theirs.master_key)
    }
}

#[cfg(test)]
mod tests {
    use e2ee_crypto::{OlmAccount, PickleKey};

    use super::*;
    use crate::identities::{DeviceKeys, PrivateCrossSigningIdentity};
    use crate::store::{Changes, MemoryStore};

    fn user(name: &str) -> UserId {
        UserId::parse(format!("@{name}:example.org")).unwrap()
    }

    fn new_device(user_id: &UserId, id: &str) -> (OlmAccount, Device) {
        let account = OlmAccount::new();
        let keys =
            DeviceKeys::for_account(user_id.clone(), DeviceId::parse(id).unwrap(), &account).unwrap();
        (account, Device::new(keys))
    }

    async fn resolver() -> (Arc<dyn KeyStore>, VerificationResolver) {
        let store: Arc<dyn KeyStore> = Arc::new(
            MemoryStore::in_memory(PickleKey::from_bytes([3u8; 32]))
                .await
                .unwrap(),
        );
        let resolver = VerificationResolver::new(
            Arc::clone(&store),
            user("me"),
            DeviceId::parse("MYDEVICE").unwrap(),
        );
        (store, resolver)
    }

    #[tokio::test]
    async fn test_unknown_and_unverified() {
        let (_, resolver) = resolver().await;
        let bob = user("bob");
        let (account, device) = new_device(&bob, "BOBDEV");

        let state = resolver
            .resolve(None, &bob, &bob, &account.curve25519_key(), &account.ed25519_key())
            .await;
        assert_eq!(state, VerificationState::UnknownDevice);

        let state = resolver
            .resolve(Some(&device), &bob, &bob, &account.curve25519_key(), &account.ed25519_key())
            .await;
        assert_eq!(state, VerificationState::Unverified);
    }

    #[tokio::test]
    async fn test_mismatched_keys_never_verified() {
        let (_, resolver) = resolver().await;
        let bob = user("bob");
        let (account, mut device) = new_device(&bob, "BOBDEV");
        device.local_trust = LocalTrust::Verified;

        let state = resolver
            .resolve(Some(&device), &bob, &bob, "forged-curve", &account.ed25519_key())
            .await;
        assert_eq!(state, VerificationState::MismatchedSender);

        let state = resolver
            .resolve(Some(&device), &user("eve"), &bob, &account.curve25519_key(), &account.ed25519_key())
            .await;
        assert_eq!(state, VerificationState::MismatchedSender);
    }

    #[tokio::test]
    async fn test_local_trust_and_blacklist() {
        let (_, resolver) = resolver().await;
        let bob = user("bob");
        let (account, mut device) = new_device(&bob, "BOBDEV");
        let (curve, ed) = (account.curve25519_key(), account.ed25519_key());

        device.local_trust = LocalTrust::Verified;
        assert_eq!(
            resolver.resolve(Some(&device), &bob, &bob, &curve, &ed).await,
            VerificationState::Verified
        );

        device.local_trust = LocalTrust::BlackListed;
        assert_eq!(
            resolver.resolve(Some(&device), &bob, &bob, &curve, &ed).await,
            VerificationState::Unverified
        );
    }

    #[tokio::test]
    async fn test_rotated_keys_resolve_unverified() {
        let (_, resolver) = resolver().await;
        let bob = user("bob");
        let (old_account, mut device) = new_device(&bob, "BOBDEV");
        device.local_trust = LocalTrust::Verified;

        let new_account = OlmAccount::new();
        device.update(
            DeviceKeys::for_account(bob.clone(), DeviceId::parse("BOBDEV").unwrap(), &new_account)
                .unwrap(),
        );

        let state = resolver
            .resolve(
                Some(&device),
                &bob,
                &bob,
                &old_account.curve25519_key(),
                &old_account.ed25519_key(),
            )
            .await;
        assert_eq!(state, VerificationState::Unverified);
    }

    #[tokio::test]
    async fn test_cross_signed_device_is_verified() {
        let (store, resolver) = resolver().await;
        let me = user("me");
        let bob = user("bob");

        let mine = PrivateCrossSigningIdentity::new(me.clone());
        let theirs = PrivateCrossSigningIdentity::new(bob.clone());
        let mut bob_identity = theirs.to_public_identity().unwrap();
        bob_identity.user_signing_key = None;
        mine.sign_user(&mut bob_identity).unwrap();

        let (account, mut device) = new_device(&bob, "BOBDEV");
        theirs.sign_device(&mut device.keys).unwrap();

        let mut changes = Changes {
            private_identity: Some(mine.clone()),
            ..Default::default()
        };
        changes.identities.new.push(mine.to_public_identity().unwrap());
        changes.identities.new.push(bob_identity);
        changes.devices.new.push(device.clone());
        store.save_changes(changes).await.unwrap();

        let state = resolver
            .resolve(Some(&device), &bob, &bob, &account.curve25519_key(), &account.ed25519_key())
            .await;
        assert_eq!(state, VerificationState::Verified);

        // Blacklisting wins over cross-signing.
        device.local_trust = LocalTrust::BlackListed;
        let state = resolver
            .resolve(Some(&device), &bob, &bob, &account.curve25519_key(), &account.ed25519_key())
            .await;
        assert_eq!(state, VerificationState::Unverified);
    }

    #[tokio::test]
    async fn test_find_device_by_previous_key() {
        let (store, resolver) = resolver().await;
        let bob = user("bob");
        let (old_account, mut device) = new_device(&bob, "BOBDEV");
        device.update(
            DeviceKeys::for_account(bob.clone(), DeviceId::parse("BOBDEV").unwrap(), &OlmAccount::new())
                .unwrap(),
        );
        let mut changes = Changes::default();
        changes.devices.new.push(device);
        store.save_changes(changes).await.unwrap();

        let found = resolver
            .find_device(&bob, None, &old_account.curve25519_key())
            .await
            .unwrap()
            .unwrap();
        assert!(!found.current_key);
        assert!(resolver.find_device(&bob, None, "nobody").await.unwrap().is_none());
    }
}
