//! Durable key/value byte storage backing the local store snapshot.
//!
//! [`SqliteKv`] is the on-disk implementation (one `kv` table in a WAL-mode
//! SQLite database).  [`MemoryKv`] keeps everything in process and can be
//! told to fail writes.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub enum KvError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Unavailable(String),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            KvError::Io(e) => write!(f, "io error: {e}"),
            KvError::Unavailable(msg) => write!(f, "storage unavailable: {msg}"),
        }
    }
}

impl std::error::Error for KvError {}

impl From<rusqlite::Error> for KvError {
    fn from(e: rusqlite::Error) -> Self {
        KvError::Sqlite(e)
    }
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        KvError::Io(e)
    }
}

pub trait KvStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    fn save(&self, key: &str, value: &[u8]) -> Result<(), KvError>;
    fn remove(&self, key: &str) -> Result<(), KvError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    /// Open or create a database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key         TEXT PRIMARY KEY,
                value       BLOB NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteKv {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let conn = lock(&self.conn);
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, crate::clock::now_millis() as i64],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        let conn = lock(&self.conn);
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save`/`remove` fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Write bytes directly, bypassing any fault injection.
    pub fn put_raw(&self, key: &str, value: &[u8]) {
        lock(&self.entries).insert(key.to_string(), value.to_vec());
    }

    pub fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.entries).get(key).cloned()
    }

    fn check_writable(&self) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl KvStore for MemoryKv {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.get_raw(key))
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.check_writable()?;
        self.put_raw(key, value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.check_writable()?;
        lock(&self.entries).remove(key);
        Ok(())
    }
}
