//! E2EE Client Core
//!
//! Key management and sync decryption for an end-to-end encrypted
//! messaging client.
//!
//! - **Key store**: pluggable, encrypted-at-rest persistence with atomic
//!   changesets (in-memory and `SQLite` backends)
//! - **Session cache**: per-session locking over the store
//! - **Decryption pipeline**: sync payload in, annotated events out
//! - **Change recorder**: one ordered commit per sync batch
//! - **Crypto manager**: the facade tying them together

pub mod ambiguity;
pub mod cache;
pub mod changes;
pub mod config;
pub mod identities;
pub mod manager;
pub mod observability;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod verification;

pub use ambiguity::{AmbiguityTracker, StagedMembers};
pub use cache::{CacheError, SessionCache};
pub use changes::{BatchChanges, ChangeRecorder, CommitOutcome};
pub use config::{ClientConfig, LogConfig, LogFormat, StoreBackend};
pub use identities::{
    CrossSigningKey, CrossSigningKeyExport, Device, DeviceKeys, KeyUsage, LocalTrust,
    PrivateCrossSigningIdentity, UserIdentity,
};
pub use manager::{
    CrossSigningStatus, CryptoManager, CryptoManagerError, RoomKeyImportResult, RoomKeyShare,
};
pub use pipeline::{DecryptionPipeline, PipelineConfig};
pub use session::{ExportedRoomKey, InboundSession, OutboundSession, RotationSettings, SessionKey};
pub use store::{
    Changes, CryptoStoreError, KeyStore, MemoryStore, RecordBackend, SecretImportError,
    SqliteStore,
};
pub use verification::VerificationResolver;
