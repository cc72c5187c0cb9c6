//! Outbox drain.
//!
//! One run walks every lane (one per kind, oldest item first), replays each
//! item against the server and settles it. Per-item failures are recorded on
//! the item and never abort the run; only a local store failure does.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::date_util::to_rfc3339;
use crate::error::Result;
use crate::model::{QueueAction, SyncQueueItem, TransactionalKind};
use crate::remote::{bounded, RemoteApi, RemoteError, RemoteRecord};
use crate::storage::repository::{self, ReconcileOutcome};
use crate::storage::{Database, Table};
use crate::sync::{RetryPolicy, SyncProgress, SyncReport};

pub const QUEUE_SCOPE: &str = "queue";

/// Meta key holding the completion time of the last drain run.
pub const LAST_SYNC_KEY: &str = "lastSync_queue";

#[derive(Debug, Clone, Copy, Default)]
pub struct DrainOptions {
    /// Replay parked items too.
    pub include_parked: bool,
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Synced,
    /// Settled without a remote call (record already reconciled or gone).
    Dropped,
    /// Still queued: the record changed while the call was in flight.
    Requeued,
    Failed,
}

pub struct QueueProcessor {
    db: Database,
    remote: Arc<dyn RemoteApi>,
    policy: RetryPolicy,
    request_timeout: Duration,
    drain_lock: Mutex<()>,
}

impl QueueProcessor {
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteApi>,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            db,
            remote,
            policy,
            request_timeout,
            drain_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn is_draining(&self) -> bool {
        self.drain_lock.try_lock().is_err()
    }

    /// Drain the queue once. A call that arrives while another run is in
    /// progress returns a `Skipped` report immediately.
    pub async fn drain(
        &self,
        options: DrainOptions,
        progress: &dyn SyncProgress,
    ) -> Result<SyncReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            log::debug!("Drain already in progress, coalescing");
            return Ok(SyncReport::skipped(QUEUE_SCOPE, "a drain run is already in progress"));
        };

        let include_parked = options.include_parked;
        let items = self
            .db
            .read(move |conn| repository::list_queue(conn, include_parked))
            .await?;

        let mut lanes: BTreeMap<TransactionalKind, Vec<SyncQueueItem>> = BTreeMap::new();
        for item in items {
            lanes.entry(item.entity_kind).or_default().push(item);
        }

        let mut synced = 0u64;
        let mut failed = 0u64;
        let mut skipped = 0u64;

        for (kind, items) in lanes {
            let total = items.len();
            log::info!("Replaying {total} queued {kind} items");
            progress.on_kind_start(kind, total);

            // Later items for a record wait until its earlier item goes through.
            let mut blocked: HashSet<i64> = HashSet::new();
            for (i, item) in items.iter().enumerate() {
                if blocked.contains(&item.entity_local_id) {
                    skipped += 1;
                } else {
                    match self.replay(item).await? {
                        Replay::Synced | Replay::Dropped => synced += 1,
                        // Newer content is still queued; not in sync yet.
                        Replay::Requeued => {
                            skipped += 1;
                            blocked.insert(item.entity_local_id);
                        }
                        Replay::Failed => {
                            failed += 1;
                            blocked.insert(item.entity_local_id);
                        }
                    }
                }
                progress.on_item(kind, i + 1, total);
            }
        }

        let finished = Utc::now();
        self.db
            .write(&[Table::SyncMeta], move |conn| {
                repository::set_meta(conn, LAST_SYNC_KEY, &to_rfc3339(finished))
            })
            .await?;

        let mut report = SyncReport::from_counts(QUEUE_SCOPE, synced, failed);
        report.items_skipped = skipped;
        report.finished_at = finished;
        log::info!(
            "Drain finished: {synced} synced, {failed} failed, {skipped} held back"
        );
        progress.on_complete(&report);
        Ok(report)
    }

    async fn replay(&self, item: &SyncQueueItem) -> Result<Replay> {
        let kind = item.entity_kind;
        let local_id = item.entity_local_id;
        let record = self
            .db
            .read(move |conn| repository::get_record(conn, kind, local_id))
            .await?;

        match item.action {
            QueueAction::Create => {
                if record.as_ref().map_or(true, |r| r.is_reconciled()) {
                    log::debug!("Create item {} already settled, dropping it", item.id);
                    self.drop_item(item).await?;
                    return Ok(Replay::Dropped);
                }
                let sent = bounded(
                    self.request_timeout,
                    self.remote.create(&item.payload, &item.idempotency_key),
                )
                .await;
                self.settle(item, sent).await
            }
            QueueAction::Update => {
                let Some(remote_id) = item
                    .remote_id
                    .clone()
                    .or_else(|| record.and_then(|r| r.remote_id))
                else {
                    log::warn!("Update item {} has no server id, dropping it", item.id);
                    self.drop_item(item).await?;
                    return Ok(Replay::Dropped);
                };
                let sent = bounded(
                    self.request_timeout,
                    self.remote
                        .update(&remote_id, &item.payload, &item.idempotency_key),
                )
                .await;
                self.settle(item, sent).await
            }
            QueueAction::Delete => {
                let Some(remote_id) = item.remote_id.as_deref() else {
                    log::warn!("Delete item {} has no server id, dropping it", item.id);
                    self.drop_item(item).await?;
                    return Ok(Replay::Dropped);
                };
                match bounded(self.request_timeout, self.remote.delete(kind, remote_id)).await {
                    Ok(()) => {
                        self.drop_item(item).await?;
                        Ok(Replay::Synced)
                    }
                    Err(e) => self.record_failure(item, e).await,
                }
            }
        }
    }

    /// Reconcile a create/update answer, or record the failure.
    async fn settle(
        &self,
        item: &SyncQueueItem,
        sent: std::result::Result<RemoteRecord, RemoteError>,
    ) -> Result<Replay> {
        let remote = match sent {
            Ok(remote) => remote,
            Err(e) => return self.record_failure(item, e).await,
        };
        let owned = item.clone();
        let outcome = self
            .db
            .write(
                &[Table::Transactional(item.entity_kind), Table::SyncQueue],
                move |conn| repository::reconcile(conn, &owned, &remote, Utc::now()),
            )
            .await?;
        Ok(match outcome {
            ReconcileOutcome::Completed => Replay::Synced,
            ReconcileOutcome::Superseded => {
                log::info!(
                    "{} {} was edited during replay; newer snapshot stays queued",
                    item.entity_kind,
                    item.entity_local_id
                );
                Replay::Requeued
            }
            ReconcileOutcome::Orphaned => {
                log::info!(
                    "{} {} was deleted during replay",
                    item.entity_kind,
                    item.entity_local_id
                );
                Replay::Synced
            }
        })
    }

    async fn drop_item(&self, item: &SyncQueueItem) -> Result<()> {
        let id = item.id;
        self.db
            .write(&[Table::SyncQueue], move |conn| {
                repository::delete_queue_item(conn, id)
            })
            .await?;
        Ok(())
    }

    async fn record_failure(&self, item: &SyncQueueItem, error: RemoteError) -> Result<Replay> {
        let attempts = item.retry_count + 1;
        let park = !error.is_transient() || self.policy.is_exhausted(attempts);
        if park {
            log::warn!(
                "Parking {} item {} after {attempts} attempts: {error}",
                item.entity_kind,
                item.id
            );
        } else {
            log::warn!(
                "Replay of {} item {} failed (attempt {attempts}): {error}",
                item.entity_kind,
                item.id
            );
        }

        let id = item.id;
        let message = error.to_string();
        self.db
            .write(&[Table::SyncQueue], move |conn| {
                repository::record_queue_failure(conn, id, &message, Utc::now(), park)
            })
            .await?;
        Ok(Replay::Failed)
    }
}
