//! Reusable helpers for client integration tests.
//!
//! Provides a local [`CryptoManager`], a [`RemoteSender`] that owns its own
//! olm account and outbound group sessions, sync payload builders, and
//! record backends that count or break writes.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use e2ee_client::store::backend::{self, BackendError, RecordKey, RecordType, StoredRecord};
use e2ee_client::store::{EncryptedStore, KeyStore, MemoryBackend, MemoryStore, RecordBackend};
use e2ee_client::{CryptoManager, DeviceKeys, PipelineConfig};
use e2ee_common::{
    DeviceId, EncryptedEnvelope, RawEvent, RoomId, SyncPayload, UnreadNotificationsCount, UserId,
    MEGOLM_V1_AES_SHA2, ROOM_ENCRYPTED, ROOM_KEY,
};
use e2ee_crypto::{EncryptedPickleKey, OlmAccount, PickleKey};
use serde_json::{json, Value};

// ============================================================================
// Identifiers
// ============================================================================

pub fn user(name: &str) -> UserId {
    UserId::parse(format!("@{name}:example.org")).expect("valid user id")
}

pub fn room(name: &str) -> RoomId {
    RoomId::parse(format!("!{name}:example.org")).expect("valid room id")
}

pub fn device(id: &str) -> DeviceId {
    DeviceId::parse(id).expect("valid device id")
}

pub fn pickle_key(seed: u8) -> PickleKey {
    PickleKey::from_bytes([seed; 32])
}

// ============================================================================
// Local side
// ============================================================================

/// A fresh in-memory store.
pub async fn memory_store() -> Arc<dyn KeyStore> {
    Arc::new(
        MemoryStore::in_memory(pickle_key(1))
            .await
            .expect("Failed to open memory store"),
    )
}

/// `@me:example.org` / `MYDEVICE` over `store`.
pub async fn local_manager_with(store: Arc<dyn KeyStore>, config: PipelineConfig) -> CryptoManager {
    CryptoManager::new(user("me"), device("MYDEVICE"), store, config)
        .await
        .expect("Failed to create crypto manager")
}

/// `@me:example.org` / `MYDEVICE` over a fresh memory store.
pub async fn local_manager() -> CryptoManager {
    local_manager_with(memory_store().await, PipelineConfig::default()).await
}

// ============================================================================
// Remote side
// ============================================================================

/// Another user's device that encrypts room events for us.
pub struct RemoteSender {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub account: OlmAccount,
    sessions: HashMap<RoomId, e2ee_client::OutboundSession>,
}

impl RemoteSender {
    pub fn new(name: &str, device_id: &str) -> Self {
        Self {
            user_id: user(name),
            device_id: device(device_id),
            account: OlmAccount::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn curve25519_key(&self) -> String {
        self.account.curve25519_key()
    }

    pub fn ed25519_key(&self) -> String {
        self.account.ed25519_key()
    }

    /// The device's signed key upload.
    pub fn device_keys(&self) -> DeviceKeys {
        DeviceKeys::for_account(self.user_id.clone(), self.device_id.clone(), &self.account).unwrap()
    }

    /// Replace the device's identity keys, keeping its device id.
    pub fn rotate_identity(&mut self) {
        self.account = OlmAccount::new();
    }

    /// Start a new outbound session for `room_id`, returning its key.
    pub fn start_session(&mut self, room_id: &RoomId) -> (String, String) {
        let session = e2ee_client::OutboundSession::new(room_id.clone());
        let ids = (session.session_id(), session.session_key());
        self.sessions.insert(room_id.clone(), session);
        ids
    }

    /// Current session id for `room_id`.
    pub fn session_id(&self, room_id: &RoomId) -> String {
        self.sessions
            .get(room_id)
            .expect("no session started for room")
            .session_id()
    }

    /// Key of the room's current session at its current index.
    pub fn session_key(&self, room_id: &RoomId) -> String {
        self.sessions
            .get(room_id)
            .expect("no session started for room")
            .session_key()
    }

    /// Send `session_key` to `manager` over a secure channel, returning
    /// whether it was installed.
    pub async fn offer_key(&self, manager: &CryptoManager, room_id: &RoomId, session_key: &str) -> bool {
        manager
            .receive_room_key(
                &self.user_id,
                &self.curve25519_key(),
                &self.ed25519_key(),
                room_id,
                session_key,
            )
            .await
            .expect("Failed to receive room key")
    }

    /// Share the room's current session with `manager` over a secure channel.
    pub async fn share_with(&mut self, manager: &CryptoManager, room_id: &RoomId) {
        let session_key = match self.sessions.get(room_id) {
            Some(session) => session.session_key(),
            None => self.start_session(room_id).1,
        };
        let accepted = self.offer_key(manager, room_id, &session_key).await;
        assert!(accepted, "room key was not installed");
    }

    /// Encrypt an event for `room_id` as an `m.room.encrypted` event.
    pub fn encrypt(&mut self, room_id: &RoomId, event_type: &str, content: Value) -> RawEvent {
        let session = self
            .sessions
            .get_mut(room_id)
            .expect("no session started for room");
        let plaintext = json!({
            "type": event_type,
            "content": content,
            "room_id": room_id,
        });
        let envelope = EncryptedEnvelope {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            sender_key: self.account.curve25519_key(),
            device_id: Some(self.device_id.clone()),
            session_id: session.session_id(),
            ciphertext: session.encrypt(&plaintext.to_string()),
        };
        RawEvent::new(json!({
            "type": ROOM_ENCRYPTED,
            "event_id": format!("$event{}:example.org", session.message_index()),
            "sender": self.user_id,
            "content": envelope,
        }))
    }

    /// Encrypt a text message.
    pub fn message(&mut self, room_id: &RoomId, body: &str) -> RawEvent {
        self.encrypt(room_id, "m.room.message", json!({"msgtype": "m.text", "body": body}))
    }

    /// Rotate in-band: start a new session and send its key through the
    /// current one.
    pub fn rekey(&mut self, room_id: &RoomId) -> RawEvent {
        let next = e2ee_client::OutboundSession::new(room_id.clone());
        let content = json!({
            "algorithm": MEGOLM_V1_AES_SHA2,
            "room_id": room_id,
            "session_id": next.session_id(),
            "session_key": next.session_key(),
        });
        let event = self.encrypt(room_id, ROOM_KEY, content);
        self.sessions.insert(room_id.clone(), next);
        event
    }
}

// ============================================================================
// Payload builders
// ============================================================================

/// A membership state event.
pub fn member(name: &str, membership: &str, displayname: Option<&str>) -> RawEvent {
    RawEvent::new(json!({
        "type": "m.room.member",
        "event_id": format!("$member-{name}-{membership}:example.org"),
        "sender": user(name),
        "state_key": user(name),
        "content": {"membership": membership, "displayname": displayname},
    }))
}

/// A plaintext message.
pub fn plain_message(sender: &str, body: &str) -> RawEvent {
    RawEvent::new(json!({
        "type": "m.room.message",
        "sender": user(sender),
        "content": {"msgtype": "m.text", "body": body},
    }))
}

/// Builder for [`SyncPayload`].
#[derive(Default)]
pub struct SyncBuilder {
    payload: SyncPayload,
    batches: usize,
}

impl SyncBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeline(mut self, room_id: &RoomId, events: Vec<RawEvent>) -> Self {
        self.payload
            .rooms
            .joined
            .entry(room_id.clone())
            .or_default()
            .timeline
            .extend(events);
        self
    }

    pub fn state(mut self, room_id: &RoomId, events: Vec<RawEvent>) -> Self {
        self.payload
            .rooms
            .joined
            .entry(room_id.clone())
            .or_default()
            .state
            .extend(events);
        self
    }

    pub fn unread(mut self, room_id: &RoomId, highlight_count: u64, notification_count: u64) -> Self {
        self.payload
            .rooms
            .joined
            .entry(room_id.clone())
            .or_default()
            .unread_notifications = UnreadNotificationsCount {
            highlight_count,
            notification_count,
        };
        self
    }

    pub fn left(mut self, room_id: &RoomId, events: Vec<RawEvent>) -> Self {
        self.payload
            .rooms
            .left
            .entry(room_id.clone())
            .or_default()
            .timeline
            .extend(events);
        self
    }

    pub fn build(mut self) -> SyncPayload {
        self.batches += 1;
        self.payload.next_batch = format!("s{}", self.batches);
        self.payload
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Wraps a backend, counting calls and breaking writes on request.
pub struct FaultyBackend<B> {
    inner: B,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
    session_reads: AtomicUsize,
}

impl<B: RecordBackend> FaultyBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            session_reads: AtomicUsize::new(0),
        }
    }

    /// Make every following batch fail partway through.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Batches that reached the backend.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Point reads of inbound session records.
    pub fn session_reads(&self) -> usize {
        self.session_reads.load(Ordering::SeqCst)
    }
}

impl<B: RecordBackend> RecordBackend for FaultyBackend<B> {
    fn get(&self, key: &RecordKey) -> backend::Result<Option<Vec<u8>>> {
        if key.record_type == RecordType::InboundSession {
            self.session_reads.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.get(key)
    }

    fn scan(&self, record_type: RecordType, owner: Option<&str>) -> backend::Result<Vec<StoredRecord>> {
        self.inner.scan(record_type, owner)
    }

    fn write_batch(&self, mut records: Vec<StoredRecord>) -> backend::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            // The inner backend accepts the leading records, then hits a
            // record it must refuse.
            if let Some(last) = records.last_mut() {
                last.key.id.clear();
                return self.inner.write_batch(records);
            }
            return Err(BackendError::Invalid("injected fault".to_owned()));
        }
        self.inner.write_batch(records)
    }

    fn load_pickle_key(&self) -> backend::Result<Option<EncryptedPickleKey>> {
        self.inner.load_pickle_key()
    }

    fn save_pickle_key(&self, key: &EncryptedPickleKey) -> backend::Result<()> {
        self.inner.save_pickle_key(key)
    }
}

pub type FaultyStore = EncryptedStore<FaultyBackend<MemoryBackend>>;

/// A memory store behind a [`FaultyBackend`].
pub async fn faulty_store() -> Arc<FaultyStore> {
    Arc::new(
        EncryptedStore::open(FaultyBackend::new(MemoryBackend::new()), pickle_key(2))
            .await
            .expect("Failed to open faulty store"),
    )
}
