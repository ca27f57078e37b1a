//! `SQLite` record backend.
//!
//! One `records` table keyed by `(record_type, owner, record_id)` and a
//! `meta` table for the wrapped pickle key. The database runs in WAL mode
//! and every batch is a single transaction.

use std::path::Path;
use std::sync::Mutex;

use e2ee_crypto::EncryptedPickleKey;
use rusqlite::{params, Connection, OptionalExtension};

use super::backend::{validate, BackendError, RecordBackend, RecordKey, RecordType, Result, StoredRecord};

const PICKLE_KEY_META: &str = "pickle_key";

/// Persistent backend on an embedded `SQLite` database.
///
/// Uses `Mutex` because `rusqlite::Connection` is `Send` but not `Sync`.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Create or open the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema cannot be initialized.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database. Mostly useful for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be initialized.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // Returns the resulting mode ("wal", or "memory" for in-memory databases).
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS records (
                record_type TEXT NOT NULL,
                owner TEXT NOT NULL CHECK (length(owner) > 0),
                record_id TEXT NOT NULL CHECK (length(record_id) > 0),
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (record_type, owner, record_id)
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| BackendError::Poisoned)
    }
}

fn record_type_from_str(value: &str) -> Option<RecordType> {
    [
        RecordType::Account,
        RecordType::Device,
        RecordType::UserIdentity,
        RecordType::InboundSession,
        RecordType::OutboundSession,
        RecordType::PrivateIdentity,
        RecordType::BackupKey,
        RecordType::SyncToken,
        RecordType::Canary,
    ]
    .into_iter()
    .find(|t| t.as_str() == value)
}

impl RecordBackend for SqliteBackend {
    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM records WHERE record_type = ?1 AND owner = ?2 AND record_id = ?3",
                params![key.record_type.as_str(), key.owner, key.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn scan(&self, record_type: RecordType, owner: Option<&str>) -> Result<Vec<StoredRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_type, owner, record_id, value FROM records
             WHERE record_type = ?1 AND (?2 IS NULL OR owner = ?2)
             ORDER BY owner, record_id",
        )?;
        let rows = stmt.query_map(params![record_type.as_str(), owner], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (stored_type, owner, id, value) = row?;
            let record_type = record_type_from_str(&stored_type)
                .ok_or_else(|| BackendError::Invalid(format!("unknown record type {stored_type}")))?;
            records.push(StoredRecord {
                key: RecordKey::new(record_type, owner, id),
                value,
            });
        }
        Ok(records)
    }

    fn write_batch(&self, records: Vec<StoredRecord>) -> Result<()> {
        for record in &records {
            validate(record)?;
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp_millis();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO records (record_type, owner, record_id, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (record_type, owner, record_id)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )?;
            for record in &records {
                stmt.execute(params![
                    record.key.record_type.as_str(),
                    record.key.owner,
                    record.key.id,
                    record.value,
                    now
                ])?;
            }
        }
        // Dropping `tx` on an early return above rolls the batch back.
        tx.commit()?;
        Ok(())
    }

    fn load_pickle_key(&self) -> Result<Option<EncryptedPickleKey>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![PICKLE_KEY_META],
                |row| row.get(0),
            )
            .optional()?;

        value
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| BackendError::Invalid(format!("stored pickle key: {e}")))
            })
            .transpose()
    }

    fn save_pickle_key(&self, key: &EncryptedPickleKey) -> Result<()> {
        let json = serde_json::to_string(key)
            .map_err(|e| BackendError::Invalid(format!("pickle key: {e}")))?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![PICKLE_KEY_META, json],
        )?;
        Ok(())
    }
}
