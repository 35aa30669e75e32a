mod conversations;
pub mod error;
mod messages;
pub mod migrations;
pub mod models;
mod reactions;
mod read_status;
mod users;

pub use error::{Result, StoreError};
pub use messages::MessageCursor;
pub use reactions::ReactionToggle;
pub use read_status::ReadMark;

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, Transaction};
use tracing::info;

const READER_POOL_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long after posting a sender may still edit a message.
    pub edit_window: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            edit_window: Duration::minutes(15),
        }
    }
}

/// Messaging store with a single writer and a small round-robin reader pool
/// (WAL mode allows readers to proceed while the writer holds its lock).
pub struct Database {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    reader_idx: AtomicUsize,
    options: StoreOptions,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: &Path, options: StoreOptions) -> Result<Self> {
        let writer = Connection::open(path)?;

        // WAL mode for concurrent reads
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            readers.push(Mutex::new(conn));
        }

        info!(
            "Messaging store opened at {} (1 writer + {} readers)",
            path.display(),
            READER_POOL_SIZE
        );
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            reader_idx: AtomicUsize::new(0),
            options,
        })
    }

    /// In-memory store, useful for testing. Uses a single shared connection,
    /// since separate `:memory:` connections would be separate databases.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(StoreOptions::default())
    }

    pub fn open_in_memory_with(options: StoreOptions) -> Result<Self> {
        let writer = Connection::open_in_memory()?;
        writer.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&writer)?;

        Ok(Self {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            reader_idx: AtomicUsize::new(0),
            options,
        })
    }

    pub(crate) fn edit_window(&self) -> Duration {
        self.options.edit_window
    }

    /// Run a read against the reader pool (or the writer when no pool exists).
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if self.readers.is_empty() {
            let conn = self
                .writer
                .lock()
                .map_err(|e| StoreError::Internal(format!("writer lock poisoned: {e}")))?;
            return f(&conn);
        }

        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|e| StoreError::Internal(format!("reader lock poisoned: {e}")))?;
        f(&conn)
    }

    /// Run `f` inside a single transaction on the writer. Commits on `Ok`,
    /// rolls back on `Err`, so a failed operation never leaves a partial write.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self
            .writer
            .lock()
            .map_err(|e| StoreError::Internal(format!("writer lock poisoned: {e}")))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// -- Timestamp encoding --
//
// Timestamps are written from the Rust side as fixed-width RFC 3339
// (microseconds, Z suffix) so SQL string comparison equals chronological
// comparison.

pub(crate) fn encode_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_str() -> String {
    encode_dt(Utc::now())
}

pub(crate) fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Internal(format!("corrupt timestamp {s:?}: {e}")))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Database;
    use matchpoint_types::models::{Conversation, ConversationType};
    use uuid::Uuid;

    pub fn store() -> Database {
        Database::open_in_memory().expect("in-memory store")
    }

    pub fn direct(db: &Database, a: Uuid, b: Uuid) -> Conversation {
        db.create_conversation(ConversationType::Direct, None, &[a, b])
            .expect("direct conversation")
    }

    pub fn group(db: &Database, title: &str, members: &[Uuid]) -> Conversation {
        db.create_conversation(ConversationType::Group, Some(title), members)
            .expect("group conversation")
    }
}
