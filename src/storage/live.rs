use std::sync::Arc;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;

use super::{Database, Table};
use crate::error::{Error, Result};

/// A query whose result set is kept current as its backing tables change.
///
/// Holds `None` until the first run completes, then the latest rows. The
/// background task stops once every receiver is gone. Must be created from
/// within a Tokio runtime.
pub struct LiveQuery<T> {
    rx: watch::Receiver<Option<Vec<T>>>,
}

impl<T> LiveQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn spawn<F>(db: Database, tables: Vec<Table>, query: F) -> Self
    where
        F: Fn(&rusqlite::Connection) -> std::result::Result<Vec<T>, rusqlite::Error>
            + Send
            + Sync
            + 'static,
    {
        let (tx, rx) = watch::channel(None);
        // Subscribe before the first run so no write slips between the two.
        let mut changes = db.subscribe();
        let query = Arc::new(query);

        tokio::spawn(async move {
            loop {
                let run = Arc::clone(&query);
                match db.read(move |conn| run(conn)).await {
                    Ok(rows) => {
                        if tx.send(Some(rows)).is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!("Live query failed: {e}"),
                }

                loop {
                    tokio::select! {
                        _ = tx.closed() => return,
                        msg = changes.recv() => match msg {
                            Ok(table) if tables.contains(&table) => break,
                            Ok(_) => {}
                            Err(RecvError::Lagged(skipped)) => {
                                log::debug!("Live query lagged {skipped} change events, re-running");
                                break;
                            }
                            Err(RecvError::Closed) => return,
                        },
                    }
                }

                // Collapse a burst of writes into one re-run.
                loop {
                    match changes.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Closed) => return,
                    }
                }
            }
        });

        Self { rx }
    }

    /// Latest rows, or `None` before the first run has finished.
    pub fn current(&self) -> Option<Vec<T>> {
        self.rx.borrow().clone()
    }

    /// Wait for the first resolution and return it.
    pub async fn ready(&mut self) -> Result<Vec<T>> {
        let value = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Other("live query stopped".into()))?;
        Ok(value.clone().unwrap_or_default())
    }

    /// Wait for the next result set.
    pub async fn changed(&mut self) -> Result<Vec<T>> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::Other("live query stopped".into()))?;
        Ok(self.rx.borrow_and_update().clone().unwrap_or_default())
    }

    /// A raw receiver, for callers that want to `select!` on updates.
    pub fn subscribe(&self) -> watch::Receiver<Option<Vec<T>>> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::payload::fixtures;
    use crate::model::{StoredRecord, TransactionalEntity, TransactionalKind};
    use crate::storage::repository;

    fn live_dotations(db: &Database) -> LiveQuery<StoredRecord> {
        let kind = TransactionalKind::FuelDotation;
        db.live(&[Table::Transactional(kind)], move |conn| {
            repository::list_records(conn, kind)
        })
    }

    async fn create_offline(db: &Database, key: &'static str) {
        let payload = fixtures::dotation("trk-1", 30.0).into_payload();
        db.write(
            &[
                Table::Transactional(TransactionalKind::FuelDotation),
                Table::SyncQueue,
            ],
            move |conn| repository::insert_pending_with_queue(conn, &payload, key, chrono::Utc::now()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_live_query_resolves_then_follows_writes() {
        let db = Database::open_memory().await.unwrap();
        let mut live = live_dotations(&db);

        assert!(live.ready().await.unwrap().is_empty());

        create_offline(&db, "k1").await;
        let rows = live.changed().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].pending_sync);

        create_offline(&db, "k2").await;
        let rows = live.changed().await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_live_query_ignores_other_tables() {
        let db = Database::open_memory().await.unwrap();
        let mut live = live_dotations(&db);
        live.ready().await.unwrap();

        db.write(&[Table::AppConfig], |conn| {
            repository::set_config(conn, "debounce_ms", "10")
        })
        .await
        .unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(100), live.changed()).await;
        assert!(waited.is_err(), "unrelated write must not re-fire");
    }
}
