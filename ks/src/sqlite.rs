//! SQLite-backed storage shared between processes
//!
//! All peers open the same database file. Change detection polls
//! `PRAGMA data_version`, which moves only when *another* connection commits,
//! so a peer never sees its own writes. SQLite cannot say which row changed,
//! so every notification is keyless.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::NOTIFY_CHANNEL_CAPACITY;
use crate::backend::{KvBackend, StoreChange};
use crate::error::StoreError;

/// Default interval between change polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 25;

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default database location shared by the command-line tools
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("intercom")
        .join("store.db")
}

/// Key-value storage in a SQLite database file
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    tx: broadcast::Sender<StoreChange>,
    poller: Option<JoinHandle<()>>,
}

impl SqliteBackend {
    /// Open (or create) the database with the default poll interval
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_poll(path, Duration::from_millis(DEFAULT_POLL_INTERVAL_MS))
    }

    /// Open (or create) the database, polling for foreign commits every `poll_interval`
    ///
    /// Polling needs a tokio runtime; outside one the backend still works but
    /// never notifies.
    pub fn open_with_poll(path: impl AsRef<Path>, poll_interval: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, ?poll_interval, "SqliteBackend::open: called");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        apply_pragmas(&conn)?;
        initialize_schema(&conn)?;

        let conn = Arc::new(Mutex::new(conn));
        let (tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);

        let poller = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(poll_loop(Arc::downgrade(&conn), tx.clone(), poll_interval))),
            Err(_) => {
                warn!(?path, "SqliteBackend::open: no tokio runtime, change notifications disabled");
                None
            }
        };

        info!(?path, "Opened SQLite store");
        Ok(Self {
            conn,
            path,
            tx,
            poller,
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }
}

impl KvBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(%mode, "apply_pragmas: journal mode set");
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key   TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn data_version(conn: &Mutex<Connection>) -> Result<i64, StoreError> {
    let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
    let version = conn.query_row("PRAGMA data_version", [], |row| row.get::<_, i64>(0))?;
    Ok(version)
}

async fn poll_loop(conn: Weak<Mutex<Connection>>, tx: broadcast::Sender<StoreChange>, interval: Duration) {
    debug!(?interval, "poll_loop: started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<i64> = None;

    loop {
        ticker.tick().await;
        let Some(conn) = conn.upgrade() else {
            debug!("poll_loop: store dropped, exiting");
            return;
        };

        match data_version(&conn) {
            Ok(version) => {
                if last.is_some_and(|prev| prev != version) {
                    debug!(version, "poll_loop: foreign commit detected");
                    let _ = tx.send(StoreChange::unknown());
                }
                last = Some(version);
            }
            Err(e) => warn!(error = %e, "poll_loop: failed to read data_version"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_crud_without_runtime() {
        let temp = TempDir::new().unwrap();
        let store = SqliteBackend::open(temp.path().join("kv.db")).unwrap();

        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));

        store.set("a", "x").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "k".to_string()]);

        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("dir").join("kv.db");
        let store = SqliteBackend::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_foreign_commit_notifies_other_connection_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kv.db");
        let poll = Duration::from_millis(5);
        let a = SqliteBackend::open_with_poll(&path, poll).unwrap();
        let b = SqliteBackend::open_with_poll(&path, poll).unwrap();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        // Let both pollers record their baseline version
        tokio::time::sleep(Duration::from_millis(30)).await;

        a.set("k", "v").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
            .await
            .expect("b should be notified")
            .unwrap();
        assert_eq!(change, StoreChange::unknown());
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(a_rx.try_recv().is_err());
    }
}
