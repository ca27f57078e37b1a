//! Decryption Pipeline
//!
//! Turns the timelines of a raw sync payload into [`SyncRoomEvent`]s.
//! Plaintext events pass through unchanged; encrypted events are decrypted
//! through the [`SessionCache`] and annotated with [`EncryptionInfo`]. An
//! event that cannot be decrypted is emitted undecrypted with an
//! [`UnableToDecrypt`] marker; nothing is ever dropped.
//!
//! Rooms are processed concurrently, events within one room strictly in
//! order. Session mutations are serialized by each session's lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use e2ee_common::{
    AlgorithmInfo, DecryptedPayload, DecryptionFailure, DeviceId, EncryptedEnvelope,
    EncryptionInfo, RawEvent, RoomId, SyncRoomEvent, UnableToDecrypt, UserId, VerificationState,
    MEGOLM_V1_AES_SHA2, ROOM_KEY,
};
use e2ee_crypto::CryptoError;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheError, SessionCache};
use crate::changes::BatchChanges;
use crate::session::{InboundSession, SessionKey};
use crate::verification::{ResolvedDevice, VerificationResolver};

/// Decryption pipeline behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Decrypt events from devices missing from the store and tag them
    /// [`VerificationState::UnknownDevice`] instead of refusing.
    pub decrypt_unknown_devices: bool,
    /// Leave events whose sender keys do not match the resolved device
    /// undecrypted instead of tagging them
    /// [`VerificationState::MismatchedSender`].
    pub reject_mismatched_sender: bool,
    /// Rooms decrypted concurrently.
    pub max_concurrent_rooms: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decrypt_unknown_devices: false,
            reject_mismatched_sender: false,
            max_concurrent_rooms: 8,
        }
    }
}

/// Content of an in-band `m.room_key` event.
#[derive(Debug, Deserialize)]
struct RoomKeyContent {
    #[serde(default)]
    algorithm: Option<String>,
    room_id: RoomId,
    session_id: String,
    session_key: String,
}

/// Keys and sender recorded on the session that decrypted an event.
struct SessionOrigin {
    sender: UserId,
    sender_key: String,
    signing_key: String,
    claimed_keys: BTreeMap<String, String>,
}

/// Decrypts sync timelines.
pub struct DecryptionPipeline {
    cache: Arc<SessionCache>,
    resolver: Arc<VerificationResolver>,
    config: PipelineConfig,
}

impl std::fmt::Debug for DecryptionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DecryptionPipeline {
    /// Create a pipeline.
    pub fn new(
        cache: Arc<SessionCache>,
        resolver: Arc<VerificationResolver>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            cache,
            resolver,
            config,
        }
    }

    /// Pipeline configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Decrypt the timelines of several rooms concurrently.
    ///
    /// The output holds one entry per input room, each with exactly as many
    /// events as its input timeline.
    #[instrument(skip_all, fields(rooms = timelines.len()))]
    pub async fn decrypt_rooms(
        &self,
        timelines: Vec<(RoomId, Vec<RawEvent>)>,
        batch: &BatchChanges,
    ) -> BTreeMap<RoomId, Vec<SyncRoomEvent>> {
        stream::iter(timelines)
            .map(|(room_id, timeline)| async move {
                let events = self.decrypt_timeline(&room_id, timeline, batch).await;
                (room_id, events)
            })
            .buffer_unordered(self.config.max_concurrent_rooms.max(1))
            .collect()
            .await
    }

    /// Decrypt one room's timeline in order.
    pub async fn decrypt_timeline(
        &self,
        room_id: &RoomId,
        timeline: Vec<RawEvent>,
        batch: &BatchChanges,
    ) -> Vec<SyncRoomEvent> {
        let mut events = Vec::with_capacity(timeline.len());
        for event in timeline {
            events.push(self.decrypt_event(room_id, event, batch).await);
        }
        events
    }

    /// Decrypt a single event.
    ///
    /// Plaintext events come back unchanged. Failures are attached to the
    /// returned event and never abort the caller.
    pub async fn decrypt_event(
        &self,
        room_id: &RoomId,
        event: RawEvent,
        batch: &BatchChanges,
    ) -> SyncRoomEvent {
        if !event.is_encrypted() {
            return SyncRoomEvent::plain(event);
        }

        let envelope = match event.encrypted_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%room_id, event_id = ?event.event_id(), error = %e, "Malformed encrypted event");
                return SyncRoomEvent::undecrypted(
                    event,
                    UnableToDecrypt {
                        failure: DecryptionFailure::MalformedEvent,
                        session_id: None,
                        sender_key: None,
                    },
                );
            }
        };

        match self.decrypt_envelope(room_id, &event, &envelope, batch).await {
            Ok(decrypted) => decrypted,
            Err(failure) => {
                match failure {
                    DecryptionFailure::MacMismatch
                    | DecryptionFailure::MismatchedSender
                    | DecryptionFailure::RoomMismatch
                    | DecryptionFailure::StoreUnavailable => warn!(
                        %room_id,
                        event_id = ?event.event_id(),
                        session_id = %envelope.session_id,
                        %failure,
                        "Failed to decrypt event"
                    ),
                    _ => debug!(
                        %room_id,
                        event_id = ?event.event_id(),
                        session_id = %envelope.session_id,
                        %failure,
                        "Could not decrypt event"
                    ),
                }
                SyncRoomEvent::undecrypted(
                    event,
                    UnableToDecrypt {
                        failure,
                        session_id: Some(envelope.session_id),
                        sender_key: Some(envelope.sender_key),
                    },
                )
            }
        }
    }

    async fn decrypt_envelope(
        &self,
        room_id: &RoomId,
        event: &RawEvent,
        envelope: &EncryptedEnvelope,
        batch: &BatchChanges,
    ) -> Result<SyncRoomEvent, DecryptionFailure> {
        let sender = event
            .sender()
            .map_err(|_| DecryptionFailure::MalformedEvent)?;
        if envelope.algorithm != MEGOLM_V1_AES_SHA2 {
            return Err(DecryptionFailure::UnsupportedAlgorithm);
        }

        let resolved = self
            .resolver
            .find_device(&sender, envelope.device_id.as_ref(), &envelope.sender_key)
            .await
            .map_err(|e| {
                warn!(error = %e, "Device lookup failed");
                DecryptionFailure::StoreUnavailable
            })?;
        if resolved.is_none() && !self.config.decrypt_unknown_devices {
            return Err(DecryptionFailure::UnknownDevice);
        }

        let session = self
            .cache
            .get_or_load(&envelope.sender_key, &envelope.session_id)
            .await
            .map_err(|e| {
                warn!(error = %e, "Session lookup failed");
                DecryptionFailure::StoreUnavailable
            })?
            .ok_or(DecryptionFailure::SessionNotFound)?;

        let (decrypted, origin) = {
            let mut guard = session.lock().await;
            if guard.room_id() != room_id {
                return Err(DecryptionFailure::RoomMismatch);
            }

            if self.config.reject_mismatched_sender {
                if let Some(resolved) = &resolved {
                    let state = VerificationResolver::key_state(
                        &resolved.device,
                        &sender,
                        guard.sender(),
                        guard.sender_key(),
                        guard.signing_key(),
                    );
                    if state == Some(VerificationState::MismatchedSender) {
                        return Err(DecryptionFailure::MismatchedSender);
                    }
                }
            }

            let before = guard.message_counter();
            let decrypted = guard.decrypt(&envelope.ciphertext).map_err(|e| match e {
                CryptoError::UnknownMessageIndex { .. } => DecryptionFailure::UnknownMessageIndex,
                _ => DecryptionFailure::MacMismatch,
            })?;
            if guard.message_counter() > before {
                batch.add_inbound_session(guard.key(), Arc::clone(&session));
            }

            let origin = SessionOrigin {
                sender: guard.sender().clone(),
                sender_key: guard.sender_key().to_owned(),
                signing_key: guard.signing_key().to_owned(),
                claimed_keys: guard.sender_claimed_keys(),
            };
            (decrypted, origin)
        };

        let payload: DecryptedPayload = serde_json::from_str(&decrypted.plaintext)
            .map_err(|_| DecryptionFailure::MalformedEvent)?;
        if &payload.room_id != room_id {
            return Err(DecryptionFailure::RoomMismatch);
        }

        let verification_state = self
            .resolver
            .resolve(
                resolved.as_ref().map(|r| &r.device),
                &sender,
                &origin.sender,
                &origin.sender_key,
                &origin.signing_key,
            )
            .await;

        if payload.event_type == ROOM_KEY {
            self.rekey(room_id, &sender, resolved.as_ref(), verification_state, &origin, &payload.content, batch)
                .await;
        }

        let sender_device: Option<DeviceId> = resolved
            .as_ref()
            .map(|r| r.device.device_id().clone())
            .or_else(|| envelope.device_id.clone());
        let info = EncryptionInfo {
            sender,
            sender_device,
            algorithm_info: AlgorithmInfo::MegolmV1AesSha2 {
                curve25519_key: origin.sender_key,
                sender_claimed_keys: origin.claimed_keys,
                session_id: envelope.session_id.clone(),
                message_index: decrypted.message_index,
            },
            verification_state,
        };

        Ok(SyncRoomEvent::decrypted(
            event.with_decrypted(&payload.event_type, payload.content),
            info,
        ))
    }

    /// Install the session carried by an in-band room key.
    ///
    /// Only accepted from a known device using its current keys.
    #[allow(clippy::too_many_arguments)]
    async fn rekey(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        resolved: Option<&ResolvedDevice>,
        state: VerificationState,
        origin: &SessionOrigin,
        content: &serde_json::Value,
        batch: &BatchChanges,
    ) {
        let acceptable = resolved.is_some_and(|r| r.current_key)
            && matches!(state, VerificationState::Verified | VerificationState::Unverified);
        if !acceptable {
            warn!(%room_id, %sender, ?state, "Ignoring room key from an untrusted or rotated device");
            return;
        }

        let content = match RoomKeyContent::deserialize(content) {
            Ok(content) => content,
            Err(e) => {
                warn!(%room_id, error = %e, "Malformed room key");
                return;
            }
        };
        if content.algorithm.as_deref().is_some_and(|a| a != MEGOLM_V1_AES_SHA2) || &content.room_id != room_id {
            warn!(%room_id, "Ignoring room key for another room or algorithm");
            return;
        }

        let session = match InboundSession::new(
            content.room_id,
            sender.clone(),
            origin.sender_key.clone(),
            origin.signing_key.clone(),
            &content.session_key,
        ) {
            Ok(session) if session.session_id() == content.session_id => session,
            Ok(_) => {
                warn!(%room_id, "Room key session id does not match its key");
                return;
            }
            Err(e) => {
                warn!(%room_id, error = %e, "Invalid room key");
                return;
            }
        };

        let key: SessionKey = session.key();
        match self.cache.insert(session).await {
            Ok(handle) => {
                debug!(%room_id, session_id = %key.session_id, "Installed rotated room key");
                batch.add_inbound_session(key, handle);
            }
            Err(CacheError::AlreadyKnown { .. } | CacheError::Rollback { .. }) => {
                debug!(%room_id, session_id = %key.session_id, "Rotated room key already known");
            }
            Err(e) => warn!(%room_id, error = %e, "Rejected rotated room key"),
        }
    }

    /// The cache this pipeline decrypts through.
    #[must_use]
    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }
}
