//! Session Cache
//!
//! The in-memory working set of inbound group sessions. Each
//! `(sender_key, session_id)` owns one slot; the slot's lock is held while
//! the session is loaded from the store, so concurrent lookups for the same
//! session share a single store round-trip and never produce two in-memory
//! copies.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::session::{InboundSession, SessionKey, SharedInboundSession};
use crate::store::{CryptoStoreError, KeyStore};

/// Session cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Inserting would move the session's message counter backwards.
    #[error("Refusing to roll session {session_id} back from index {current} to {attempted}")]
    Rollback {
        /// Session id.
        session_id: String,
        /// Counter of the cached session.
        current: u32,
        /// Counter of the rejected session.
        attempted: u32,
    },

    /// A copy reaching as far back as the offered one is already known.
    #[error("Session {session_id} is already known from index {first_known_index}")]
    AlreadyKnown {
        /// Session id.
        session_id: String,
        /// First known index of the cached session.
        first_known_index: u32,
    },

    /// Loading from the store failed.
    #[error("Store error: {0}")]
    Store(#[from] CryptoStoreError),
}

/// Session cache result type.
pub type Result<T> = std::result::Result<T, CacheError>;

type Slot = Arc<Mutex<Option<SharedInboundSession>>>;

/// Concurrency-safe session working set over a [`KeyStore`].
pub struct SessionCache {
    store: Arc<dyn KeyStore>,
    slots: DashMap<SessionKey, Slot>,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl SessionCache {
    /// Create an empty cache over `store`.
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: &SessionKey) -> Slot {
        // The shard guard from `entry` is dropped before anything awaits.
        Arc::clone(self.slots.entry(key.clone()).or_default().value())
    }

    /// Give up our handle on `slot` and drop it from the map if it is still
    /// empty and nobody else holds it. The caller must have released its
    /// lock on the slot.
    fn release_empty(&self, key: &SessionKey, slot: Slot) {
        let ptr = Arc::as_ptr(&slot);
        drop(slot);
        // `remove_if` holds the shard's write lock, so no one can clone the
        // slot out of the map while the predicate runs. Whoever lets go last
        // sees a count of one.
        self.slots.remove_if(key, |_, current| {
            Arc::as_ptr(current) == ptr
                && Arc::strong_count(current) == 1
                && current.try_lock().is_ok_and(|guard| guard.is_none())
        });
    }

    /// Serve a session from memory, loading it from the store on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails. Neither a miss nor a
    /// failed lookup is cached; the next call asks the store again.
    #[instrument(skip(self), level = "trace")]
    pub async fn get_or_load(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<SharedInboundSession>> {
        let key = SessionKey::new(sender_key, session_id);
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref() {
            return Ok(Some(Arc::clone(session)));
        }

        match self.store.get_session(sender_key, session_id).await {
            Ok(Some(session)) => {
                debug!(session_id, "Loaded inbound session from store");
                let shared = Arc::new(Mutex::new(session));
                *guard = Some(Arc::clone(&shared));
                Ok(Some(shared))
            }
            Ok(None) => {
                drop(guard);
                self.release_empty(&key, slot);
                Ok(None)
            }
            Err(e) => {
                drop(guard);
                self.release_empty(&key, slot);
                Err(e.into())
            }
        }
    }

    /// Insert or replace a session.
    ///
    /// A known session (cached or stored) is only replaced by a copy that
    /// reaches further back, i.e. has a lower first known index, and whose
    /// message counter is not lower. The replacement is swapped into the
    /// existing shared handle, so every holder observes it.
    ///
    /// # Errors
    ///
    /// [`CacheError::Rollback`] for a lower counter,
    /// [`CacheError::AlreadyKnown`] when the known copy reaches as far back,
    /// or a store error.
    pub async fn insert(&self, session: InboundSession) -> Result<SharedInboundSession> {
        let key = session.key();
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;

        if guard.is_none() {
            match self.store.get_session(&key.sender_key, &key.session_id).await {
                Ok(Some(stored)) => *guard = Some(Arc::new(Mutex::new(stored))),
                Ok(None) => {}
                Err(e) => {
                    drop(guard);
                    self.release_empty(&key, slot);
                    return Err(e.into());
                }
            }
        }

        if let Some(existing) = guard.as_ref() {
            let existing = Arc::clone(existing);
            let mut current = existing.lock().await;
            if session.message_counter() < current.message_counter() {
                return Err(CacheError::Rollback {
                    session_id: key.session_id,
                    current: current.message_counter(),
                    attempted: session.message_counter(),
                });
            }
            if session.first_known_index() >= current.first_known_index() {
                return Err(CacheError::AlreadyKnown {
                    session_id: key.session_id,
                    first_known_index: current.first_known_index(),
                });
            }
            *current = session;
            drop(current);
            return Ok(existing);
        }

        let shared = Arc::new(Mutex::new(session));
        *guard = Some(Arc::clone(&shared));
        Ok(shared)
    }

    /// The cached session, without touching the store.
    pub async fn get_cached(&self, sender_key: &str, session_id: &str) -> Option<SharedInboundSession> {
        let key = SessionKey::new(sender_key, session_id);
        let slot = self.slots.get(&key).map(|entry| Arc::clone(entry.value()))?;
        let guard = slot.lock().await;
        let cached = guard.clone();
        drop(guard);
        if cached.is_none() {
            self.release_empty(&key, slot);
        }
        cached
    }

    /// Number of cached sessions and lookups in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
