use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{QueueAction, RecordPayload, ReferenceKind, TransactionalEntity, TransactionalKind};

/// A cached operational record as stored locally, payload still tagged.
///
/// `local_id` is the primary key and never changes; `remote_id` is attached
/// on reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub local_id: i64,
    pub remote_id: Option<String>,
    /// Bon number: temporary while pending, server-assigned once reconciled.
    pub reference: Option<String>,
    pub payload: RecordPayload,
    pub pending_sync: bool,
    pub created_offline: bool,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    pub fn kind(&self) -> TransactionalKind {
        self.payload.kind()
    }

    pub fn is_reconciled(&self) -> bool {
        self.remote_id.is_some() && !self.pending_sync
    }

    /// Narrow to a typed record. `None` when the payload belongs to another kind.
    pub fn typed<T: TransactionalEntity>(self) -> Option<TransactionalRecord<T>> {
        let data = T::from_payload(self.payload)?;
        Some(TransactionalRecord {
            local_id: self.local_id,
            remote_id: self.remote_id,
            reference: self.reference,
            data,
            pending_sync: self.pending_sync,
            created_offline: self.created_offline,
            created_at: self.created_at,
            synced_at: self.synced_at,
        })
    }
}

/// Typed view of a cached operational record, as returned by façades.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionalRecord<T> {
    pub local_id: i64,
    pub remote_id: Option<String>,
    pub reference: Option<String>,
    pub data: T,
    pub pending_sync: bool,
    pub created_offline: bool,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Server-side lookup entity as delivered by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceData {
    pub remote_id: String,
    pub label: String,
    pub active: bool,
    pub fields: serde_json::Value,
}

/// Locally cached lookup entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceRecord {
    pub local_id: i64,
    pub kind: ReferenceKind,
    pub remote_id: Option<String>,
    pub label: String,
    pub active: bool,
    pub fields: serde_json::Value,
    pub cached_at: DateTime<Utc>,
}

/// Outbox entry awaiting replay against the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncQueueItem {
    pub id: i64,
    pub entity_kind: TransactionalKind,
    pub entity_local_id: i64,
    pub action: QueueAction,
    /// Server id targeted by update and delete items.
    pub remote_id: Option<String>,
    pub payload: RecordPayload,
    /// Sent with every replay so the server can drop duplicates.
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Excluded from normal drain runs until retried or forced.
    pub parked: bool,
}

impl SyncQueueItem {
    pub fn is_failed(&self) -> bool {
        self.retry_count > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindQueueStats {
    pub pending: u64,
    pub failed: u64,
}

/// Queue aggregates as read from the store in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub failed: u64,
    pub parked: u64,
    pub by_kind: BTreeMap<TransactionalKind, KindQueueStats>,
}
