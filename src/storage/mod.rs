pub mod live;
pub mod repository;

use rusqlite_migration::{Migrations, M};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::model::{ReferenceKind, TransactionalKind};

pub use live::LiveQuery;

/// A table whose committed changes are announced on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Reference(ReferenceKind),
    Transactional(TransactionalKind),
    SyncQueue,
    SyncMeta,
    AppConfig,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Reference(kind) => kind.table(),
            Table::Transactional(kind) => kind.table(),
            Table::SyncQueue => "sync_queue",
            Table::SyncMeta => "sync_meta",
            Table::AppConfig => "app_config",
        }
    }
}

const CHANGE_FEED_CAPACITY: usize = 256;

/// Database wraps two `tokio_rusqlite::Connection` instances (writer + reader)
/// using WAL mode for concurrent access. The writer serializes writes via
/// `tokio_rusqlite`'s internal channel; the reader can proceed without blocking.
///
/// Writes that go through [`Database::write`] publish the tables they touched
/// once the closure has returned successfully, which drives [`LiveQuery`].
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
    changes: broadcast::Sender<Table>,
}

impl Database {
    /// Open the database at the default path (`~/.fleetsync/fleetsync.db`).
    pub async fn open() -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?
            .join(".fleetsync");
        std::fs::create_dir_all(&dir).map_err(|e| Error::Config(e.to_string()))?;
        Self::open_at(dir.join("fleetsync.db")).await
    }

    /// Open the database at the given path.
    pub async fn open_at(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let writer = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_writer(&writer).await?;

        let reader = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_reader(&reader).await?;

        log::debug!("Opened local store at {}", path.display());
        Ok(Self::from_connections(writer, reader))
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let writer = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init_writer(&writer).await?;

        // For in-memory, we share the same connection for reader/writer
        // since in-memory DBs are per-connection.
        Ok(Self::from_connections(writer.clone(), writer))
    }

    fn from_connections(
        writer: tokio_rusqlite::Connection,
        reader: tokio_rusqlite::Connection,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            writer,
            reader,
            changes,
        }
    }

    async fn init_writer(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA foreign_keys=ON;\
                 PRAGMA busy_timeout=5000;",
            )
            .map_err(|e| e.to_string())?;
            migrations().to_latest(conn).map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        })
        .await
        .map_err(|e| Error::Migration(e.to_string()))
    }

    async fn init_reader(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA busy_timeout=5000;",
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;
        Ok(())
    }

    /// Get a reference to the writer connection.
    ///
    /// Writes issued directly on the writer are not announced on the change
    /// feed; prefer [`Database::write`].
    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    /// Get a reference to the reader connection.
    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }

    /// Run `f` on the writer and announce `touched` tables after it succeeds.
    ///
    /// Multi-row changes must open a transaction inside `f`; the closure
    /// either commits everything or nothing.
    pub async fn write<F, R>(&self, touched: &[Table], f: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> std::result::Result<R, rusqlite::Error>
            + Send
            + 'static,
        R: Send + 'static,
    {
        let result = self.writer.call(f).await?;
        self.notify(touched);
        Ok(result)
    }

    /// Run a read-only closure on the reader connection.
    pub async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> std::result::Result<R, rusqlite::Error>
            + Send
            + 'static,
        R: Send + 'static,
    {
        Ok(self.reader.call(f).await?)
    }

    /// Announce changes made outside [`Database::write`].
    pub fn notify(&self, touched: &[Table]) {
        for table in touched {
            // No receivers is fine: nobody is observing.
            let _ = self.changes.send(*table);
        }
    }

    /// Subscribe to committed table changes.
    pub fn subscribe(&self) -> broadcast::Receiver<Table> {
        self.changes.subscribe()
    }

    /// Build a live query that re-runs `query` whenever one of `tables` changes.
    pub fn live<T, F>(&self, tables: &[Table], query: F) -> LiveQuery<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&rusqlite::Connection) -> std::result::Result<Vec<T>, rusqlite::Error>
            + Send
            + Sync
            + 'static,
    {
        LiveQuery::spawn(self.clone(), tables.to_vec(), query)
    }
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_initial.sql"))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory() {
        let db = Database::open_memory().await.unwrap();

        let tables: Vec<String> = db
            .reader()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok::<Vec<String>, rusqlite::Error>(rows.filter_map(|r| r.ok()).collect())
            })
            .await
            .unwrap();

        for kind in TransactionalKind::ALL {
            assert!(tables.contains(&kind.table().to_string()), "missing {}", kind.table());
        }
        for kind in ReferenceKind::ALL {
            assert!(tables.contains(&kind.table().to_string()), "missing {}", kind.table());
        }
        assert!(tables.contains(&"sync_queue".to_string()));
        assert!(tables.contains(&"sync_meta".to_string()));
        assert!(tables.contains(&"app_config".to_string()));
    }

    #[test]
    fn test_migrations_validate() {
        assert!(migrations().validate().is_ok());
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let db = Database::open_at(&path).await.unwrap();
            db.write(&[Table::SyncMeta], |conn| {
                repository::set_meta(conn, "lastSync_vehicle", "2025-01-01T00:00:00.000Z")
            })
            .await
            .unwrap();
        }

        let db = Database::open_at(&path).await.unwrap();
        let value = db
            .read(|conn| repository::get_meta(conn, "lastSync_vehicle"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("2025-01-01T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn test_write_announces_tables() {
        let db = Database::open_memory().await.unwrap();
        let mut rx = db.subscribe();

        db.write(&[Table::AppConfig], |conn| {
            repository::set_config(conn, "api_base_url", "http://localhost:8080")
        })
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap(), Table::AppConfig);
    }
}
