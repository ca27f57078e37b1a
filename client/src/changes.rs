//! Change Recording
//!
//! Collects the changeset fragments produced while processing one sync
//! batch (advanced or rotated sessions, device and identity discoveries)
//! and commits them with a single [`KeyStore::save_changes`] call.
//!
//! Sync batches are numbered from a monotonically increasing token seeded
//! from the store. The store refuses a batch older than the last one it
//! committed, so a superseded batch can never overwrite newer state. The
//! inbound sessions such a batch touched are still written as a local
//! changeset: they are the live cache handles, whose state only moves
//! forward.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, instrument, warn};

use crate::identities::{Device, UserIdentity};
use crate::session::{SessionKey, SharedInboundSession, SharedOutboundSession};
use crate::store::{Changes, CryptoStoreError, KeyStore, Result};

/// Result of committing a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The changeset was written.
    Committed {
        /// Batch token, `None` for local mutations.
        sync_token: Option<u64>,
        /// Number of records written, excluding the token.
        records: usize,
    },
    /// Nothing to write.
    Skipped,
    /// A newer sync batch already committed; nothing was written.
    Rejected {
        /// Last committed token.
        committed: u64,
        /// Token of the dropped batch.
        attempted: u64,
    },
}

#[derive(Default)]
struct Pending {
    inbound: HashMap<SessionKey, SharedInboundSession>,
    changes: Changes,
}

/// Changeset under construction.
///
/// Safe to fill from concurrently running room tasks. Recording the same
/// inbound session twice keeps one entry.
pub struct BatchChanges {
    sync_token: Option<u64>,
    pending: Mutex<Pending>,
}

impl std::fmt::Debug for BatchChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchChanges")
            .field("sync_token", &self.sync_token)
            .finish_non_exhaustive()
    }
}

impl BatchChanges {
    fn new(sync_token: Option<u64>) -> Self {
        Self {
            sync_token,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Batch token, `None` for local mutations.
    #[must_use]
    pub const fn sync_token(&self) -> Option<u64> {
        self.sync_token
    }

    fn with<R>(&self, f: impl FnOnce(&mut Pending) -> R) -> R {
        // A panic while holding the lock leaves plain data behind.
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut pending)
    }

    /// Record a new or advanced inbound session.
    pub fn add_inbound_session(&self, key: SessionKey, session: SharedInboundSession) {
        self.with(|pending| {
            pending.inbound.insert(key, session);
        });
    }

    /// Record a new or advanced outbound session.
    pub fn add_outbound_session(&self, session: SharedOutboundSession) {
        self.with(|pending| pending.changes.outbound_sessions.push(session));
    }

    /// Record a device seen for the first time.
    pub fn add_new_device(&self, device: Device) {
        self.with(|pending| pending.changes.devices.new.push(device));
    }

    /// Record a changed device.
    pub fn add_changed_device(&self, device: Device) {
        self.with(|pending| pending.changes.devices.changed.push(device));
    }

    /// Record a device its owner stopped listing.
    pub fn add_deleted_device(&self, device: Device) {
        self.with(|pending| pending.changes.devices.deleted.push(device));
    }

    /// Record a new or changed identity.
    pub fn add_identity(&self, identity: UserIdentity, is_new: bool) {
        self.with(|pending| {
            if is_new {
                pending.changes.identities.new.push(identity);
            } else {
                pending.changes.identities.changed.push(identity);
            }
        });
    }

    /// Direct access to the changeset for everything else.
    pub fn update(&self, f: impl FnOnce(&mut Changes)) {
        self.with(|pending| f(&mut pending.changes));
    }

    /// Number of recorded inbound sessions.
    #[must_use]
    pub fn inbound_session_count(&self) -> usize {
        self.with(|pending| pending.inbound.len())
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.with(|pending| pending.inbound.is_empty() && pending.changes.is_empty())
    }

    fn into_changes(self) -> Changes {
        let sync_token = self.sync_token;
        let pending = self.pending.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut changes = pending.changes;
        changes.inbound_sessions.extend(pending.inbound.into_values());
        changes.sync_token = sync_token;
        changes
    }
}

/// Issues sync tokens and commits batches.
pub struct ChangeRecorder {
    store: Arc<dyn KeyStore>,
    next_token: AtomicU64,
}

impl std::fmt::Debug for ChangeRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeRecorder")
            .field("next_token", &self.next_token)
            .finish_non_exhaustive()
    }
}

impl ChangeRecorder {
    /// Create a recorder whose first token follows the store's last
    /// committed one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot report its last token.
    pub async fn new(store: Arc<dyn KeyStore>) -> Result<Self> {
        let next = store.last_sync_token().await?.map_or(1, |token| token + 1);
        Ok(Self {
            store,
            next_token: AtomicU64::new(next),
        })
    }

    /// Start collecting changes for a new sync batch.
    #[must_use]
    pub fn begin_sync_batch(&self) -> BatchChanges {
        BatchChanges::new(Some(self.next_token.fetch_add(1, Ordering::SeqCst)))
    }

    /// Start collecting changes outside of sync processing.
    #[must_use]
    pub fn begin_local(&self) -> BatchChanges {
        BatchChanges::new(None)
    }

    /// Commit a batch with one `save_changes` call.
    ///
    /// A sync batch is always written, even without records, so its token
    /// advances the store's high-water mark. A stale batch is rejected, but
    /// its inbound sessions are written again without a token so sessions
    /// first seen in that batch are not lost.
    ///
    /// # Errors
    ///
    /// Returns store errors other than the stale-batch rejection.
    #[instrument(skip_all, fields(sync_token = ?batch.sync_token()))]
    pub async fn commit(&self, batch: BatchChanges) -> Result<CommitOutcome> {
        let changes = batch.into_changes();
        if changes.is_empty() && changes.sync_token.is_none() {
            return Ok(CommitOutcome::Skipped);
        }

        let sync_token = changes.sync_token;
        let records = changes.record_count();
        let inbound = changes.inbound_sessions.clone();
        match self.store.save_changes(changes).await {
            Ok(()) => {
                debug!(records, "Committed changeset");
                Ok(CommitOutcome::Committed {
                    sync_token,
                    records,
                })
            }
            Err(CryptoStoreError::ConsistencyViolation {
                committed,
                attempted,
            }) => {
                warn!(committed, attempted, records, "Dropping changeset of a superseded sync batch");
                if !inbound.is_empty() {
                    let sessions = inbound.len();
                    self.store
                        .save_changes(Changes {
                            inbound_sessions: inbound,
                            ..Changes::default()
                        })
                        .await?;
                    debug!(sessions, "Kept inbound sessions of the superseded batch");
                }
                Ok(CommitOutcome::Rejected {
                    committed,
                    attempted,
                })
            }
            Err(e) => Err(e),
        }
    }
}
