pub mod processor;
pub mod reference;
pub mod retry;
pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::TransactionalKind;

pub use processor::{DrainOptions, QueueProcessor};
pub use reference::ReferenceSynchronizer;
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerConfig};

/// Report returned after a sync operation completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    /// What was synced: `queue` or `reference:<kind>`.
    pub scope: String,
    pub status: SyncStatus,
    pub items_synced: u64,
    pub items_failed: u64,
    /// Items held back this run, e.g. behind a failed create for the same record.
    pub items_skipped: u64,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    /// Create a SyncReport with the appropriate status derived from counts.
    pub fn from_counts(scope: impl Into<String>, items_synced: u64, items_failed: u64) -> Self {
        let status = if items_failed == 0 {
            SyncStatus::Success
        } else if items_synced > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        };
        let error = if items_failed > 0 {
            Some(format!("{items_failed} items failed"))
        } else {
            None
        };
        Self {
            scope: scope.into(),
            status,
            items_synced,
            items_failed,
            items_skipped: 0,
            error,
            finished_at: Utc::now(),
        }
    }

    /// Nothing was attempted.
    pub fn skipped(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            status: SyncStatus::Skipped,
            items_synced: 0,
            items_failed: 0,
            items_skipped: 0,
            error: Some(reason.into()),
            finished_at: Utc::now(),
        }
    }

    /// The whole operation failed before any item could be processed.
    pub fn failed(scope: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            scope: scope.into(),
            status: SyncStatus::Failed,
            items_synced: 0,
            items_failed: 0,
            items_skipped: 0,
            error: Some(error.to_string()),
            finished_at: Utc::now(),
        }
    }

    pub fn has_failures(&self) -> bool {
        matches!(self.status, SyncStatus::PartialFailure | SyncStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
    /// Another run held the lock, or the engine was offline.
    Skipped,
}

/// Progress callbacks for a drain run. All methods default to no-ops.
pub trait SyncProgress: Send + Sync {
    fn on_kind_start(&self, _kind: TransactionalKind, _total: usize) {}

    /// Called after each item of a lane, with a 1-based position.
    fn on_item(&self, _kind: TransactionalKind, _current: usize, _total: usize) {}

    fn on_complete(&self, _report: &SyncReport) {}
}

pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(SyncReport::from_counts("queue", 3, 0).status, SyncStatus::Success);
        assert_eq!(
            SyncReport::from_counts("queue", 3, 1).status,
            SyncStatus::PartialFailure
        );
        let failed = SyncReport::from_counts("queue", 0, 2);
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("2 items failed"));
        assert!(failed.has_failures());
        assert!(!SyncReport::skipped("queue", "offline").has_failures());
    }
}
