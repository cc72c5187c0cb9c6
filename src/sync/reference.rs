use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::date_util::to_rfc3339;
use crate::error::Result;
use crate::model::{ReferenceKind, ReferenceRecord};
use crate::remote::{bounded, RemoteApi};
use crate::storage::repository;
use crate::storage::{Database, LiveQuery, Table};
use crate::sync::{SyncProgress, SyncReport};

/// Keeps the read-only lookup caches (vehicles, drivers, ...) current.
pub struct ReferenceSynchronizer {
    db: Database,
    remote: Arc<dyn RemoteApi>,
    request_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<ReferenceKind>>>,
}

/// Marks a kind as being refreshed until dropped.
struct RefreshGuard {
    kind: ReferenceKind,
    in_flight: Arc<Mutex<HashSet<ReferenceKind>>>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.kind);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn scope(kind: ReferenceKind) -> String {
    format!("reference:{kind}")
}

impl ReferenceSynchronizer {
    pub fn new(db: Database, remote: Arc<dyn RemoteApi>, request_timeout: Duration) -> Self {
        Self {
            db,
            remote,
            request_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn try_begin(&self, kind: ReferenceKind) -> Option<RefreshGuard> {
        if !lock(&self.in_flight).insert(kind) {
            return None;
        }
        Some(RefreshGuard {
            kind,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Fetch `kind` from the server and make the cache match it.
    ///
    /// Local ids of rows that survive are kept. A remote failure leaves the
    /// cache as it was and is reported, not returned as an error.
    pub async fn refresh(&self, kind: ReferenceKind) -> Result<SyncReport> {
        let Some(_guard) = self.try_begin(kind) else {
            log::debug!("Refresh of {kind} already running");
            return Ok(SyncReport::skipped(scope(kind), "refresh already running"));
        };

        let rows = match bounded(self.request_timeout, self.remote.fetch_reference(kind)).await {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("Could not refresh {kind}: {e}");
                return Ok(SyncReport::failed(scope(kind), e));
            }
        };

        let now = Utc::now();
        let outcome = self
            .db
            .write(&[Table::Reference(kind), Table::SyncMeta], move |conn| {
                let outcome = repository::replace_references(conn, kind, &rows, now)?;
                repository::set_meta(conn, &kind.meta_key(), &to_rfc3339(now))?;
                Ok(outcome)
            })
            .await?;

        log::info!(
            "Refreshed {kind}: {} cached, {} pruned",
            outcome.upserted,
            outcome.pruned
        );
        let mut report = SyncReport::from_counts(scope(kind), outcome.upserted as u64, 0);
        report.finished_at = now;
        Ok(report)
    }

    /// Refresh every kind, one after the other.
    pub async fn refresh_all(&self, progress: &dyn SyncProgress) -> Result<Vec<SyncReport>> {
        let mut reports = Vec::with_capacity(ReferenceKind::ALL.len());
        for kind in ReferenceKind::ALL {
            let report = self.refresh(kind).await?;
            progress.on_complete(&report);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Refresh only the kinds whose cache is older than `max_age`.
    pub async fn refresh_stale(&self, max_age: Duration) -> Result<Vec<SyncReport>> {
        let mut reports = Vec::new();
        for kind in ReferenceKind::ALL {
            if self.is_stale(kind, max_age).await? {
                reports.push(self.refresh(kind).await?);
            }
        }
        Ok(reports)
    }

    pub async fn last_synced(&self, kind: ReferenceKind) -> Result<Option<DateTime<Utc>>> {
        self.db
            .read(move |conn| repository::get_meta_timestamp(conn, &kind.meta_key()))
            .await
    }

    /// Never-synced kinds are stale.
    pub async fn is_stale(&self, kind: ReferenceKind, max_age: Duration) -> Result<bool> {
        let Some(last) = self.last_synced(kind).await? else {
            return Ok(true);
        };
        let age = Utc::now().signed_duration_since(last);
        Ok(age.to_std().map_or(false, |age| age >= max_age))
    }

    pub async fn list(&self, kind: ReferenceKind) -> Result<Vec<ReferenceRecord>> {
        self.db
            .read(move |conn| repository::list_references(conn, kind))
            .await
    }

    pub async fn get(&self, kind: ReferenceKind, local_id: i64) -> Result<Option<ReferenceRecord>> {
        self.db
            .read(move |conn| repository::get_reference(conn, kind, local_id))
            .await
    }

    pub async fn find_by_remote_id(
        &self,
        kind: ReferenceKind,
        remote_id: &str,
    ) -> Result<Option<ReferenceRecord>> {
        let remote_id = remote_id.to_string();
        self.db
            .read(move |conn| repository::find_reference_by_remote_id(conn, kind, &remote_id))
            .await
    }

    pub fn live(&self, kind: ReferenceKind) -> LiveQuery<ReferenceRecord> {
        self.db.live(&[Table::Reference(kind)], move |conn| {
            repository::list_references(conn, kind)
        })
    }
}
