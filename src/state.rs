//! Process-wide sync status.
//!
//! [`SyncState`] is only ever changed by [`reduce`] applying a [`SyncAction`],
//! so every mutation point is a named action. [`SyncStateStore`] owns the
//! current value behind a watch channel and exposes the operator actions
//! (sync now, retry, clear).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::model::{KindQueueStats, QueueStats, SyncQueueItem, TransactionalKind};
use crate::network::NetworkMonitor;
use crate::storage::repository::{self, ClearOutcome};
use crate::storage::{Database, Table};
use crate::sync::processor::{LAST_SYNC_KEY, QUEUE_SCOPE};
use crate::sync::{DrainOptions, QueueProcessor, SyncProgress, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncProgressState {
    pub kind: TransactionalKind,
    pub current: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
    pub is_online: bool,
    pub is_syncing: bool,
    /// Queue items not yet acknowledged by the server, parked ones included.
    pub pending_count: u64,
    /// Items with at least one failed attempt.
    pub failed_count: u64,
    pub parked_count: u64,
    pub queue_by_kind: BTreeMap<TransactionalKind, KindQueueStats>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_progress: Option<SyncProgressState>,
    pub last_report: Option<SyncReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    SetOnline(bool),
    SyncStarted,
    Progress(SyncProgressState),
    SyncFinished(Option<SyncReport>),
    QueueRecomputed {
        stats: QueueStats,
        last_sync_time: Option<DateTime<Utc>>,
    },
}

pub fn reduce(state: &mut SyncState, action: SyncAction) {
    match action {
        SyncAction::SetOnline(online) => state.is_online = online,
        SyncAction::SyncStarted => {
            state.is_syncing = true;
            state.sync_progress = None;
        }
        SyncAction::Progress(progress) => state.sync_progress = Some(progress),
        SyncAction::SyncFinished(report) => {
            state.is_syncing = false;
            state.sync_progress = None;
            if report.is_some() {
                state.last_report = report;
            }
        }
        SyncAction::QueueRecomputed {
            stats,
            last_sync_time,
        } => {
            state.pending_count = stats.pending;
            state.failed_count = stats.failed;
            state.parked_count = stats.parked;
            state.queue_by_kind = stats.by_kind;
            state.last_sync_time = last_sync_time;
        }
    }
}

struct StoreInner {
    db: Database,
    processor: Arc<QueueProcessor>,
    monitor: NetworkMonitor,
    state: watch::Sender<SyncState>,
    syncing: AtomicBool,
}

/// Explicitly constructed and passed around; clones share state.
#[derive(Clone)]
pub struct SyncStateStore {
    inner: Arc<StoreInner>,
}

/// Clears `syncing` and reports the end of the run however it exits.
struct RunGuard<'a> {
    store: &'a SyncStateStore,
    report: Option<SyncReport>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.store
            .dispatch(SyncAction::SyncFinished(self.report.take()));
        self.store.inner.syncing.store(false, Ordering::SeqCst);
    }
}

impl SyncStateStore {
    pub fn new(db: Database, processor: Arc<QueueProcessor>, monitor: NetworkMonitor) -> Self {
        let initial = SyncState {
            is_online: monitor.is_online(),
            ..SyncState::default()
        };
        let (state, _) = watch::channel(initial);
        Self {
            inner: Arc::new(StoreInner {
                db,
                processor,
                monitor,
                state,
                syncing: AtomicBool::new(false),
            }),
        }
    }

    pub fn dispatch(&self, action: SyncAction) {
        self.inner.state.send_modify(|state| reduce(state, action));
    }

    pub fn snapshot(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    /// Re-read queue aggregates and the last sync time from the store.
    pub async fn refresh(&self) -> Result<()> {
        let (stats, last_sync_time) = self
            .inner
            .db
            .read(|conn| {
                let stats = repository::queue_stats(conn)?;
                let last = repository::get_meta_timestamp(conn, LAST_SYNC_KEY)?;
                Ok((stats, last))
            })
            .await?;
        self.dispatch(SyncAction::QueueRecomputed {
            stats,
            last_sync_time,
        });
        Ok(())
    }

    /// Drain the queue unless a run is already going or the engine is offline.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.run(DrainOptions::default()).await
    }

    /// Drain including parked items. Still refuses to run offline.
    pub async fn force_sync_now(&self) -> Result<SyncReport> {
        self.run(DrainOptions {
            include_parked: true,
        })
        .await
    }

    /// Make failed items eligible again (retry counters are kept) and replay
    /// them when online.
    pub async fn retry_failed(&self) -> Result<SyncReport> {
        let released = self
            .inner
            .db
            .write(&[Table::SyncQueue], |conn| repository::unpark_failed(conn))
            .await?;
        log::info!("Released {released} failed queue items for retry");
        self.refresh().await?;
        self.sync_now().await
    }

    /// Irreversibly drop every failed item and the pending record behind each
    /// failed create. Refuses unless `confirmed`.
    pub async fn clear_failed(&self, confirmed: bool) -> Result<ClearOutcome> {
        if !confirmed {
            return Err(Error::ConfirmationRequired);
        }
        let mut touched = vec![Table::SyncQueue];
        touched.extend(TransactionalKind::ALL.map(Table::Transactional));
        let outcome = self
            .inner
            .db
            .write(&touched, |conn| repository::clear_failed(conn))
            .await?;
        log::warn!(
            "Cleared {} failed queue items and {} unsent records",
            outcome.items,
            outcome.records
        );
        self.refresh().await?;
        Ok(outcome)
    }

    pub async fn queue_items(&self) -> Result<Vec<SyncQueueItem>> {
        self.inner
            .db
            .read(|conn| repository::list_queue(conn, true))
            .await
    }

    async fn run(&self, options: DrainOptions) -> Result<SyncReport> {
        if !self.inner.monitor.is_online() {
            return Ok(SyncReport::skipped(QUEUE_SCOPE, "offline"));
        }
        if self
            .inner
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(SyncReport::skipped(QUEUE_SCOPE, "a sync is already running"));
        }

        self.dispatch(SyncAction::SyncStarted);
        let mut guard = RunGuard {
            store: self,
            report: None,
        };
        let report = self.inner.processor.drain(options, self).await?;
        self.refresh().await?;
        guard.report = Some(report.clone());
        Ok(report)
    }

    /// Keep `is_online` and the queue aggregates current in the background.
    pub fn spawn_watchers(&self) -> Vec<JoinHandle<()>> {
        let online = {
            let store = self.clone();
            self.inner
                .monitor
                .on_change(move |online| store.dispatch(SyncAction::SetOnline(online)))
        };
        // Catch a transition that committed before the watcher existed.
        self.dispatch(SyncAction::SetOnline(self.inner.monitor.is_online()));

        let store = self.clone();
        let mut changes = self.inner.db.subscribe();
        let queue = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(Table::SyncQueue | Table::Transactional(_)) | Err(RecvError::Lagged(_)) => {}
                    Ok(_) => continue,
                    Err(RecvError::Closed) => return,
                }
                // Collapse a burst of writes into one recompute.
                loop {
                    match changes.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Closed) => return,
                    }
                }
                if let Err(e) = store.refresh().await {
                    log::warn!("Could not recompute sync state: {e}");
                }
            }
        });

        vec![online, queue]
    }
}

impl SyncProgress for SyncStateStore {
    fn on_item(&self, kind: TransactionalKind, current: usize, total: usize) {
        self.dispatch(SyncAction::Progress(SyncProgressState {
            kind,
            current,
            total,
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::payload::fixtures;
    use crate::model::TransactionalEntity;
    use crate::remote::{MockRemote, RemoteError};
    use crate::sync::{RetryPolicy, SyncStatus};

    struct Harness {
        db: Database,
        remote: Arc<MockRemote>,
        monitor: NetworkMonitor,
        store: SyncStateStore,
    }

    async fn harness(online: bool) -> Harness {
        let db = Database::open_memory().await.unwrap();
        let remote = Arc::new(MockRemote::new());
        let monitor = NetworkMonitor::new(online, Duration::ZERO);
        let processor = Arc::new(QueueProcessor::new(
            db.clone(),
            remote.clone(),
            RetryPolicy::default(),
            Duration::from_secs(5),
        ));
        let store = SyncStateStore::new(db.clone(), processor, monitor.clone());
        Harness {
            db,
            remote,
            monitor,
            store,
        }
    }

    async fn create_offline(db: &Database, key: &str) -> i64 {
        let payload = fixtures::dotation("trk-1", 25.0).into_payload();
        let key = key.to_string();
        db.write(
            &[
                Table::Transactional(TransactionalKind::FuelDotation),
                Table::SyncQueue,
            ],
            move |conn| repository::insert_pending_with_queue(conn, &payload, &key, Utc::now()),
        )
        .await
        .unwrap()
        .local_id
    }

    #[test]
    fn test_reducer() {
        let mut state = SyncState::default();
        reduce(&mut state, SyncAction::SetOnline(true));
        reduce(&mut state, SyncAction::SyncStarted);
        assert!(state.is_online && state.is_syncing);

        let progress = SyncProgressState {
            kind: TransactionalKind::StockExit,
            current: 1,
            total: 3,
        };
        reduce(&mut state, SyncAction::Progress(progress));
        assert_eq!(state.sync_progress, Some(progress));

        let mut stats = QueueStats {
            pending: 4,
            failed: 1,
            parked: 1,
            ..QueueStats::default()
        };
        stats.by_kind.insert(
            TransactionalKind::StockExit,
            KindQueueStats {
                pending: 4,
                failed: 1,
            },
        );
        reduce(
            &mut state,
            SyncAction::QueueRecomputed {
                stats,
                last_sync_time: None,
            },
        );
        assert_eq!((state.pending_count, state.failed_count), (4, 1));
        assert_eq!(state.queue_by_kind[&TransactionalKind::StockExit].pending, 4);

        reduce(&mut state, SyncAction::SyncFinished(None));
        assert!(!state.is_syncing);
        assert_eq!(state.sync_progress, None);
    }

    #[tokio::test]
    async fn test_sync_now_is_noop_offline() {
        let h = harness(false).await;
        create_offline(&h.db, "k1").await;
        let report = h.store.sync_now().await.unwrap();
        assert_eq!(report.status, SyncStatus::Skipped);
        assert_eq!(h.remote.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_sync_now_updates_state() {
        let h = harness(true).await;
        create_offline(&h.db, "k1").await;
        h.store.refresh().await.unwrap();
        assert_eq!(h.store.snapshot().pending_count, 1);

        let report = h.store.sync_now().await.unwrap();
        assert_eq!(report.status, SyncStatus::Success);

        let state = h.store.snapshot();
        assert_eq!(state.pending_count, 0);
        assert!(!state.is_syncing);
        assert!(state.last_sync_time.is_some());
        assert_eq!(state.last_report.map(|r| r.items_synced), Some(1));
    }

    #[tokio::test]
    async fn test_retry_and_clear_failed() {
        let h = harness(true).await;
        let local_id = create_offline(&h.db, "k1").await;
        h.remote.fail_next([RemoteError::Rejected {
            status: 422,
            message: "tank empty".into(),
        }]);
        h.store.sync_now().await.unwrap();
        let state = h.store.snapshot();
        assert_eq!((state.failed_count, state.parked_count), (1, 1));

        // Not parked any more, counters kept, replay fails again.
        h.remote.fail_next([RemoteError::Timeout]);
        h.store.retry_failed().await.unwrap();
        let items = h.store.queue_items().await.unwrap();
        assert_eq!(items[0].retry_count, 2);
        assert!(!items[0].parked);

        assert!(matches!(
            h.store.clear_failed(false).await,
            Err(Error::ConfirmationRequired)
        ));
        let outcome = h.store.clear_failed(true).await.unwrap();
        assert_eq!((outcome.items, outcome.records), (1, 1));
        assert!(h.store.queue_items().await.unwrap().is_empty());
        let gone = h
            .db
            .read(move |conn| repository::get_record(conn, TransactionalKind::FuelDotation, local_id))
            .await
            .unwrap();
        assert!(gone.is_none());
        assert_eq!(h.store.snapshot().failed_count, 0);
    }

    #[tokio::test]
    async fn test_force_sync_includes_parked() {
        let h = harness(true).await;
        create_offline(&h.db, "k1").await;
        h.remote.fail_next([RemoteError::Rejected {
            status: 409,
            message: "duplicate".into(),
        }]);
        h.store.sync_now().await.unwrap();

        let normal = h.store.sync_now().await.unwrap();
        assert_eq!(normal.items_synced, 0);
        let forced = h.store.force_sync_now().await.unwrap();
        assert_eq!(forced.items_synced, 1);
        assert_eq!(h.store.snapshot().pending_count, 0);

        h.monitor.set_online(false);
        let offline = h.store.force_sync_now().await.unwrap();
        assert_eq!(offline.status, SyncStatus::Skipped);
    }

    #[tokio::test]
    async fn test_watchers_follow_monitor_and_queue() {
        let h = harness(false).await;
        let mut rx = h.store.subscribe();
        let handles = h.store.spawn_watchers();

        h.monitor.set_online(true);
        rx.wait_for(|s| s.is_online).await.unwrap();

        create_offline(&h.db, "k1").await;
        rx.wait_for(|s| s.pending_count == 1).await.unwrap();

        for handle in handles {
            handle.abort();
        }
    }
}
