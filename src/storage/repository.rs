use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::date_util::{parse_timestamp, to_rfc3339};
use crate::model::{
    KindQueueStats, QueueAction, QueueStats, RecordPayload, ReferenceData, ReferenceKind,
    ReferenceRecord, StoredRecord, SyncQueueItem, TransactionalKind,
};
use crate::remote::RemoteRecord;

// ── Reference caches ───────────────────────────────────────────────

const REFERENCE_COLUMNS: &str = "local_id, remote_id, label, active, fields, cached_at";

/// Insert or refresh one reference row, keyed by remote id. The local id of an
/// existing row is preserved.
pub fn upsert_reference(
    conn: &Connection,
    kind: ReferenceKind,
    data: &ReferenceData,
    cached_at: DateTime<Utc>,
) -> Result<i64, rusqlite::Error> {
    let table = kind.table();
    let fields = to_json(&data.fields)?;
    conn.query_row(
        &format!(
            "INSERT INTO {table} (remote_id, label, active, fields, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(remote_id) DO UPDATE SET
                label=excluded.label, active=excluded.active,
                fields=excluded.fields, cached_at=excluded.cached_at
             RETURNING local_id"
        ),
        params![
            data.remote_id,
            data.label,
            data.active as i32,
            fields,
            to_rfc3339(cached_at)
        ],
        |row| row.get(0),
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceOutcome {
    pub upserted: usize,
    pub pruned: usize,
}

/// Make the cache for `kind` match `rows` exactly, in one transaction.
pub fn replace_references(
    conn: &mut Connection,
    kind: ReferenceKind,
    rows: &[ReferenceData],
    cached_at: DateTime<Utc>,
) -> Result<ReplaceOutcome, rusqlite::Error> {
    let tx = conn.transaction()?;
    let table = kind.table();

    let mut outcome = ReplaceOutcome::default();
    for data in rows {
        upsert_reference(&tx, kind, data, cached_at)?;
        outcome.upserted += 1;
    }

    let keep: HashSet<&str> = rows.iter().map(|r| r.remote_id.as_str()).collect();
    let stale: Vec<i64> = {
        let mut stmt = tx.prepare(&format!("SELECT local_id, remote_id FROM {table}"))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut stale = Vec::new();
        for row in rows {
            let (local_id, remote_id) = row?;
            if !remote_id.as_deref().is_some_and(|id| keep.contains(id)) {
                stale.push(local_id);
            }
        }
        stale
    };
    for local_id in stale {
        tx.execute(
            &format!("DELETE FROM {table} WHERE local_id = ?1"),
            params![local_id],
        )?;
        outcome.pruned += 1;
    }

    tx.commit()?;
    Ok(outcome)
}

pub fn list_references(
    conn: &Connection,
    kind: ReferenceKind,
) -> Result<Vec<ReferenceRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REFERENCE_COLUMNS} FROM {} ORDER BY label COLLATE NOCASE, local_id",
        kind.table()
    ))?;
    let rows = stmt.query_map([], |row| reference_from_row(kind, row))?;
    rows.collect()
}

pub fn get_reference(
    conn: &Connection,
    kind: ReferenceKind,
    local_id: i64,
) -> Result<Option<ReferenceRecord>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {REFERENCE_COLUMNS} FROM {} WHERE local_id = ?1",
            kind.table()
        ),
        params![local_id],
        |row| reference_from_row(kind, row),
    )
    .optional()
}

pub fn find_reference_by_remote_id(
    conn: &Connection,
    kind: ReferenceKind,
    remote_id: &str,
) -> Result<Option<ReferenceRecord>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {REFERENCE_COLUMNS} FROM {} WHERE remote_id = ?1",
            kind.table()
        ),
        params![remote_id],
        |row| reference_from_row(kind, row),
    )
    .optional()
}

fn reference_from_row(kind: ReferenceKind, row: &Row<'_>) -> Result<ReferenceRecord, rusqlite::Error> {
    let fields: String = row.get(4)?;
    Ok(ReferenceRecord {
        local_id: row.get(0)?,
        kind,
        remote_id: row.get(1)?,
        label: row.get(2)?,
        active: row.get::<_, i32>(3)? != 0,
        fields: from_json(4, &fields)?,
        cached_at: timestamp_column(row, 5)?,
    })
}

// ── Transactional records ──────────────────────────────────────────

const RECORD_COLUMNS: &str =
    "local_id, remote_id, reference, payload, pending_sync, created_offline, created_at, synced_at";

/// A record that has not been assigned a local id yet.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub remote_id: Option<String>,
    pub reference: Option<String>,
    pub payload: RecordPayload,
    pub pending_sync: bool,
    pub created_offline: bool,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

pub fn insert_record(conn: &Connection, record: &NewRecord) -> Result<i64, rusqlite::Error> {
    let payload = to_json(&record.payload)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (remote_id, reference, payload, pending_sync, created_offline,
                             created_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            record.payload.kind().table()
        ),
        params![
            record.remote_id,
            record.reference,
            payload,
            record.pending_sync as i32,
            record.created_offline as i32,
            to_rfc3339(record.created_at),
            record.synced_at.map(to_rfc3339),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Write a record under its existing local id, replacing whatever is there.
pub fn put_record(conn: &Connection, record: &StoredRecord) -> Result<(), rusqlite::Error> {
    let payload = to_json(&record.payload)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (local_id, remote_id, reference, payload, pending_sync,
                             created_offline, created_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(local_id) DO UPDATE SET
                remote_id=excluded.remote_id, reference=excluded.reference,
                payload=excluded.payload, pending_sync=excluded.pending_sync,
                created_offline=excluded.created_offline, created_at=excluded.created_at,
                synced_at=excluded.synced_at",
            record.kind().table()
        ),
        params![
            record.local_id,
            record.remote_id,
            record.reference,
            payload,
            record.pending_sync as i32,
            record.created_offline as i32,
            to_rfc3339(record.created_at),
            record.synced_at.map(to_rfc3339),
        ],
    )?;
    Ok(())
}

pub fn get_record(
    conn: &Connection,
    kind: TransactionalKind,
    local_id: i64,
) -> Result<Option<StoredRecord>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE local_id = ?1",
            kind.table()
        ),
        params![local_id],
        record_from_row,
    )
    .optional()
}

pub fn find_record_by_remote_id(
    conn: &Connection,
    kind: TransactionalKind,
    remote_id: &str,
) -> Result<Option<StoredRecord>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE remote_id = ?1",
            kind.table()
        ),
        params![remote_id],
        record_from_row,
    )
    .optional()
}

/// All cached records of a kind: pending first, then newest first.
pub fn list_records(
    conn: &Connection,
    kind: TransactionalKind,
) -> Result<Vec<StoredRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM {}
         ORDER BY pending_sync DESC, created_at DESC, local_id DESC",
        kind.table()
    ))?;
    let rows = stmt.query_map([], record_from_row)?;
    rows.collect()
}

/// Records of a kind matching `predicate`, in [`list_records`] order.
pub fn query_records<P>(
    conn: &Connection,
    kind: TransactionalKind,
    predicate: P,
) -> Result<Vec<StoredRecord>, rusqlite::Error>
where
    P: Fn(&StoredRecord) -> bool,
{
    Ok(list_records(conn, kind)?
        .into_iter()
        .filter(|r| predicate(r))
        .collect())
}

pub fn delete_record(
    conn: &Connection,
    kind: TransactionalKind,
    local_id: i64,
) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        &format!("DELETE FROM {} WHERE local_id = ?1", kind.table()),
        params![local_id],
    )?;
    Ok(n > 0)
}

/// (total cached, pending) for a kind.
pub fn count_records(
    conn: &Connection,
    kind: TransactionalKind,
) -> Result<(u64, u64), rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT COUNT(*), COALESCE(SUM(pending_sync), 0) FROM {}",
            kind.table()
        ),
        [],
        |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
    )
}

/// Mirror an authoritative server record into the cache, keyed by remote id.
pub fn upsert_remote_record(
    conn: &Connection,
    remote: &RemoteRecord,
    synced_at: DateTime<Utc>,
) -> Result<i64, rusqlite::Error> {
    let payload = to_json(&remote.payload)?;
    let now = to_rfc3339(synced_at);
    conn.query_row(
        &format!(
            "INSERT INTO {} (remote_id, reference, payload, pending_sync, created_offline,
                             created_at, synced_at)
             VALUES (?1, ?2, ?3, 0, 0, ?4, ?4)
             ON CONFLICT(remote_id) DO UPDATE SET
                reference=COALESCE(excluded.reference, reference),
                payload=excluded.payload, synced_at=excluded.synced_at
             RETURNING local_id",
            remote.payload.kind().table()
        ),
        params![remote.remote_id, remote.reference, payload, now],
        |row| row.get(0),
    )
}

/// Mirror a server answer onto an existing row, by local id. Returns the
/// refreshed row, or `None` when the row no longer exists; nothing is
/// inserted.
pub fn apply_remote_update(
    conn: &Connection,
    kind: TransactionalKind,
    local_id: i64,
    remote: &RemoteRecord,
    synced_at: DateTime<Utc>,
) -> Result<Option<StoredRecord>, rusqlite::Error> {
    let payload = to_json(&remote.payload)?;
    let updated = conn.execute(
        &format!(
            "UPDATE {} SET remote_id = ?1, reference = COALESCE(?2, reference), payload = ?3,
                pending_sync = 0, synced_at = ?4
             WHERE local_id = ?5",
            kind.table()
        ),
        params![
            remote.remote_id,
            remote.reference,
            payload,
            to_rfc3339(synced_at),
            local_id
        ],
    )?;
    if updated == 0 {
        return Ok(None);
    }
    get_record(conn, kind, local_id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub upserted: usize,
    pub pruned: usize,
}

/// Fold a full remote listing into the cache. Reconciled rows the server no
/// longer returns are pruned. Pending rows, and rows with an open update or
/// delete item, are never touched.
pub fn merge_remote_list(
    conn: &mut Connection,
    kind: TransactionalKind,
    records: &[RemoteRecord],
    synced_at: DateTime<Utc>,
) -> Result<MergeOutcome, rusqlite::Error> {
    let tx = conn.transaction()?;
    let table = kind.table();
    let held = queued_remote_ids(&tx, kind)?;

    let mut outcome = MergeOutcome::default();
    for remote in records
        .iter()
        .filter(|r| r.payload.kind() == kind && !held.contains(&r.remote_id))
    {
        upsert_remote_record(&tx, remote, synced_at)?;
        outcome.upserted += 1;
    }

    let keep: HashSet<&str> = records.iter().map(|r| r.remote_id.as_str()).collect();
    let stale: Vec<i64> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT local_id, remote_id FROM {table}
             WHERE pending_sync = 0 AND remote_id IS NOT NULL"
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        let mut stale = Vec::new();
        for row in rows {
            let (local_id, remote_id) = row?;
            if !keep.contains(remote_id.as_str()) && !held.contains(&remote_id) {
                stale.push(local_id);
            }
        }
        stale
    };
    for local_id in stale {
        tx.execute(
            &format!("DELETE FROM {table} WHERE local_id = ?1 AND pending_sync = 0"),
            params![local_id],
        )?;
        outcome.pruned += 1;
    }

    tx.commit()?;
    Ok(outcome)
}

/// Server ids with an update or delete still waiting in the queue.
fn queued_remote_ids(conn: &Connection, kind: TransactionalKind) -> Result<HashSet<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT remote_id FROM sync_queue WHERE entity_kind = ?1 AND remote_id IS NOT NULL",
    )?;
    let rows = stmt.query_map(params![kind.as_str()], |row| row.get(0))?;
    rows.collect()
}

/// Write a pending record and its create item in one transaction.
///
/// The temporary reference embeds the freshly allocated local id, so the row
/// is inserted first and patched before commit.
pub fn insert_pending_with_queue(
    conn: &mut Connection,
    payload: &RecordPayload,
    idempotency_key: &str,
    created_at: DateTime<Utc>,
) -> Result<StoredRecord, rusqlite::Error> {
    let kind = payload.kind();
    let tx = conn.transaction()?;

    let local_id = insert_record(
        &tx,
        &NewRecord {
            remote_id: None,
            reference: None,
            payload: payload.clone(),
            pending_sync: true,
            created_offline: true,
            created_at,
            synced_at: None,
        },
    )?;
    let reference = kind.temporary_reference(created_at, local_id);
    if reference.is_some() {
        tx.execute(
            &format!("UPDATE {} SET reference = ?1 WHERE local_id = ?2", kind.table()),
            params![reference, local_id],
        )?;
    }
    insert_queue_item(
        &tx,
        local_id,
        QueueAction::Create,
        None,
        payload,
        idempotency_key,
        created_at,
    )?;

    tx.commit()?;
    Ok(StoredRecord {
        local_id,
        remote_id: None,
        reference,
        payload: payload.clone(),
        pending_sync: true,
        created_offline: true,
        created_at,
        synced_at: None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordEdit {
    /// Still pending: the open create item now carries the new snapshot.
    Pending(StoredRecord),
    /// Reconciled: an update item carries the new snapshot.
    Queued(StoredRecord),
    NotFound,
}

/// Apply an edit locally and make sure the queue will deliver it.
///
/// A pending record has its create snapshot rewritten in place (same item id,
/// queue position and idempotency key). A reconciled record gets one update
/// item; later edits overwrite that item's snapshot and key.
pub fn edit_record_offline(
    conn: &mut Connection,
    local_id: i64,
    payload: &RecordPayload,
    idempotency_key: &str,
    edited_at: DateTime<Utc>,
) -> Result<RecordEdit, rusqlite::Error> {
    let kind = payload.kind();
    let tx = conn.transaction()?;

    let Some(mut record) = get_record(&tx, kind, local_id)? else {
        return Ok(RecordEdit::NotFound);
    };

    let body = to_json(payload)?;
    tx.execute(
        &format!("UPDATE {} SET payload = ?1 WHERE local_id = ?2", kind.table()),
        params![body, local_id],
    )?;

    let action = if record.pending_sync {
        QueueAction::Create
    } else {
        QueueAction::Update
    };
    // A create keeps its key so a request that already reached the server is
    // not duplicated. An update carries new content, so it takes the new key.
    let rewritten = match action {
        QueueAction::Update => tx.execute(
            "UPDATE sync_queue SET payload = ?1, idempotency_key = ?2
             WHERE entity_kind = ?3 AND entity_local_id = ?4 AND action = 'update'",
            params![body, idempotency_key, kind.as_str(), local_id],
        )?,
        _ => tx.execute(
            "UPDATE sync_queue SET payload = ?1
             WHERE entity_kind = ?2 AND entity_local_id = ?3 AND action = 'create'",
            params![body, kind.as_str(), local_id],
        )?,
    };
    if rewritten == 0 && action == QueueAction::Update {
        insert_queue_item(
            &tx,
            local_id,
            QueueAction::Update,
            record.remote_id.as_deref(),
            payload,
            idempotency_key,
            edited_at,
        )?;
    }

    tx.commit()?;
    record.payload = payload.clone();
    Ok(if record.pending_sync {
        RecordEdit::Pending(record)
    } else {
        RecordEdit::Queued(record)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRemoval {
    /// Never reached the server: the record and its items are gone.
    Discarded,
    /// Removed locally; a delete item will remove it from the server.
    Queued,
    NotFound,
}

/// Remove a record locally and queue its server-side deletion if it has one.
pub fn delete_record_offline(
    conn: &mut Connection,
    kind: TransactionalKind,
    local_id: i64,
    idempotency_key: &str,
    deleted_at: DateTime<Utc>,
) -> Result<RecordRemoval, rusqlite::Error> {
    let tx = conn.transaction()?;

    let Some(record) = get_record(&tx, kind, local_id)? else {
        return Ok(RecordRemoval::NotFound);
    };
    tx.execute(
        &format!("DELETE FROM {} WHERE local_id = ?1", kind.table()),
        params![local_id],
    )?;
    tx.execute(
        "DELETE FROM sync_queue
         WHERE entity_kind = ?1 AND entity_local_id = ?2 AND action IN ('create', 'update')",
        params![kind.as_str(), local_id],
    )?;

    let outcome = match record.remote_id.as_deref() {
        None => RecordRemoval::Discarded,
        Some(remote_id) => {
            insert_queue_item(
                &tx,
                local_id,
                QueueAction::Delete,
                Some(remote_id),
                &record.payload,
                idempotency_key,
                deleted_at,
            )?;
            RecordRemoval::Queued
        }
    };

    tx.commit()?;
    Ok(outcome)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Record updated and item removed.
    Completed,
    /// The record was edited while the replay was in flight. The server
    /// identity is attached; the item stays queued as an update carrying the
    /// newer snapshot under a key of its own.
    Superseded,
    /// The record was deleted while the replay was in flight. A delete item
    /// now targets the server copy.
    Orphaned,
}

/// Attach the server identity to a local record and settle the queue item
/// that carried it, atomically. The local id does not change.
///
/// A row already mirrored from a remote listing under the same remote id is
/// the same server record seen early; it is folded away first.
pub fn reconcile(
    conn: &mut Connection,
    item: &SyncQueueItem,
    remote: &RemoteRecord,
    synced_at: DateTime<Utc>,
) -> Result<ReconcileOutcome, rusqlite::Error> {
    let table = item.entity_kind.table();
    let sent = to_json(&item.payload)?;
    let server_payload = to_json(&remote.payload)?;
    let tx = conn.transaction()?;

    let current: Option<String> = tx
        .query_row(
            "SELECT payload FROM sync_queue WHERE id = ?1",
            params![item.id],
            |row| row.get(0),
        )
        .optional()?;

    let outcome = match current {
        Some(payload) if payload == sent => {
            tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![item.id])?;
            ReconcileOutcome::Completed
        }
        Some(_) => {
            // The create key now names the request that just succeeded.
            let update_key = (item.action == QueueAction::Create)
                .then(|| format!("{}:update", item.idempotency_key));
            tx.execute(
                "UPDATE sync_queue SET action = 'update', remote_id = ?1,
                    idempotency_key = COALESCE(?2, idempotency_key)
                 WHERE id = ?3",
                params![remote.remote_id, update_key, item.id],
            )?;
            ReconcileOutcome::Superseded
        }
        None => {
            if item.action == QueueAction::Create {
                insert_queue_item(
                    &tx,
                    item.entity_local_id,
                    QueueAction::Delete,
                    Some(&remote.remote_id),
                    &item.payload,
                    &format!("{}:delete", item.idempotency_key),
                    synced_at,
                )?;
            }
            ReconcileOutcome::Orphaned
        }
    };

    if outcome != ReconcileOutcome::Orphaned {
        tx.execute(
            &format!("DELETE FROM {table} WHERE remote_id = ?1 AND local_id != ?2"),
            params![remote.remote_id, item.entity_local_id],
        )?;
        let payload = (outcome == ReconcileOutcome::Completed).then_some(server_payload);
        tx.execute(
            &format!(
                "UPDATE {table} SET remote_id = ?1, reference = COALESCE(?2, reference),
                    payload = COALESCE(?3, payload), pending_sync = 0, synced_at = ?4
                 WHERE local_id = ?5"
            ),
            params![
                remote.remote_id,
                remote.reference,
                payload,
                to_rfc3339(synced_at),
                item.entity_local_id
            ],
        )?;
    }

    tx.commit()?;
    Ok(outcome)
}

// ── Sync queue ─────────────────────────────────────────────────────

const QUEUE_COLUMNS: &str = "id, entity_kind, entity_local_id, action, remote_id, payload,
     idempotency_key, created_at, retry_count, last_error, last_attempt_at, parked";

pub fn insert_queue_item(
    conn: &Connection,
    entity_local_id: i64,
    action: QueueAction,
    remote_id: Option<&str>,
    payload: &RecordPayload,
    idempotency_key: &str,
    created_at: DateTime<Utc>,
) -> Result<i64, rusqlite::Error> {
    let body = to_json(payload)?;
    conn.execute(
        "INSERT INTO sync_queue (entity_kind, entity_local_id, action, remote_id, payload,
                                 idempotency_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            payload.kind().as_str(),
            entity_local_id,
            action.as_str(),
            remote_id,
            body,
            idempotency_key,
            to_rfc3339(created_at)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_queue_item(conn: &Connection, id: i64) -> Result<Option<SyncQueueItem>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE id = ?1"),
        params![id],
        queue_item_from_row,
    )
    .optional()
}

/// Whole queue, grouped by kind and FIFO within each kind.
pub fn list_queue(
    conn: &Connection,
    include_parked: bool,
) -> Result<Vec<SyncQueueItem>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUEUE_COLUMNS} FROM sync_queue
         WHERE ?1 OR parked = 0
         ORDER BY entity_kind, id"
    ))?;
    let rows = stmt.query_map(params![include_parked], queue_item_from_row)?;
    rows.collect()
}

/// One kind's lane, oldest first.
pub fn list_queue_for_kind(
    conn: &Connection,
    kind: TransactionalKind,
    include_parked: bool,
) -> Result<Vec<SyncQueueItem>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUEUE_COLUMNS} FROM sync_queue
         WHERE entity_kind = ?1 AND (?2 OR parked = 0)
         ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![kind.as_str(), include_parked], queue_item_from_row)?;
    rows.collect()
}

pub fn find_open_create(
    conn: &Connection,
    kind: TransactionalKind,
    entity_local_id: i64,
) -> Result<Option<SyncQueueItem>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue
             WHERE entity_kind = ?1 AND entity_local_id = ?2 AND action = 'create'"
        ),
        params![kind.as_str(), entity_local_id],
        queue_item_from_row,
    )
    .optional()
}

/// Whether any queue item still refers to this record.
pub fn has_queued_work(
    conn: &Connection,
    kind: TransactionalKind,
    entity_local_id: i64,
) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sync_queue WHERE entity_kind = ?1 AND entity_local_id = ?2)",
        params![kind.as_str(), entity_local_id],
        |row| row.get(0),
    )
}

pub fn delete_queue_item(conn: &Connection, id: i64) -> Result<bool, rusqlite::Error> {
    let n = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
    Ok(n > 0)
}

/// Record a failed replay attempt. Returns the new retry count.
pub fn record_queue_failure(
    conn: &Connection,
    id: i64,
    error: &str,
    attempted_at: DateTime<Utc>,
    park: bool,
) -> Result<u32, rusqlite::Error> {
    conn.query_row(
        "UPDATE sync_queue SET
            retry_count = retry_count + 1,
            last_error = ?1,
            last_attempt_at = ?2,
            parked = CASE WHEN ?3 THEN 1 ELSE parked END
         WHERE id = ?4
         RETURNING retry_count",
        params![error, to_rfc3339(attempted_at), park, id],
        |row| row.get(0),
    )
}

/// Make every failed item eligible for the next run. Counters are kept.
pub fn unpark_failed(conn: &Connection) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE sync_queue SET parked = 0 WHERE parked = 1 OR retry_count > 0",
        [],
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearOutcome {
    pub items: usize,
    pub records: usize,
}

/// Discard failed items and the pending records behind their creates.
pub fn clear_failed(conn: &mut Connection) -> Result<ClearOutcome, rusqlite::Error> {
    let tx = conn.transaction()?;

    let failed: Vec<SyncQueueItem> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE retry_count > 0 OR parked = 1"
        ))?;
        let rows = stmt.query_map([], queue_item_from_row)?;
        rows.collect::<Result<_, _>>()?
    };

    let mut outcome = ClearOutcome::default();
    for item in &failed {
        if item.action == QueueAction::Create {
            outcome.records += tx.execute(
                &format!(
                    "DELETE FROM {} WHERE local_id = ?1 AND pending_sync = 1",
                    item.entity_kind.table()
                ),
                params![item.entity_local_id],
            )?;
        }
        outcome.items += tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![item.id])?;
    }

    tx.commit()?;
    Ok(outcome)
}

pub fn queue_stats(conn: &Connection) -> Result<QueueStats, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT entity_kind, COUNT(*),
                COALESCE(SUM(retry_count > 0), 0), COALESCE(SUM(parked), 0)
         FROM sync_queue GROUP BY entity_kind",
    )?;
    let rows = stmt.query_map([], |row| {
        let kind: String = row.get(0)?;
        Ok((
            parse_column::<TransactionalKind>(0, &kind)?,
            row.get::<_, i64>(1)? as u64,
            row.get::<_, i64>(2)? as u64,
            row.get::<_, i64>(3)? as u64,
        ))
    })?;

    let mut stats = QueueStats {
        by_kind: BTreeMap::new(),
        ..Default::default()
    };
    for row in rows {
        let (kind, pending, failed, parked) = row?;
        stats.pending += pending;
        stats.failed += failed;
        stats.parked += parked;
        stats.by_kind.insert(kind, KindQueueStats { pending, failed });
    }
    Ok(stats)
}

fn queue_item_from_row(row: &Row<'_>) -> Result<SyncQueueItem, rusqlite::Error> {
    let kind: String = row.get(1)?;
    let action: String = row.get(3)?;
    let payload: String = row.get(5)?;
    Ok(SyncQueueItem {
        id: row.get(0)?,
        entity_kind: parse_column(1, &kind)?,
        entity_local_id: row.get(2)?,
        action: parse_column(3, &action)?,
        remote_id: row.get(4)?,
        payload: from_json(5, &payload)?,
        idempotency_key: row.get(6)?,
        created_at: timestamp_column(row, 7)?,
        retry_count: row.get(8)?,
        last_error: row.get(9)?,
        last_attempt_at: optional_timestamp_column(row, 10)?,
        parked: row.get::<_, i32>(11)? != 0,
    })
}

// ── Sync meta ──────────────────────────────────────────────────────

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM sync_meta WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_meta_timestamp(
    conn: &Connection,
    key: &str,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    Ok(get_meta(conn, key)?.as_deref().and_then(parse_timestamp))
}

pub fn list_meta(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM sync_meta ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Helpers ────────────────────────────────────────────────────────

fn record_from_row(row: &Row<'_>) -> Result<StoredRecord, rusqlite::Error> {
    let payload: String = row.get(3)?;
    Ok(StoredRecord {
        local_id: row.get(0)?,
        remote_id: row.get(1)?,
        reference: row.get(2)?,
        payload: from_json(3, &payload)?,
        pending_sync: row.get::<_, i32>(4)? != 0,
        created_offline: row.get::<_, i32>(5)? != 0,
        created_at: timestamp_column(row, 6)?,
        synced_at: optional_timestamp_column(row, 7)?,
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<String, rusqlite::Error> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> Result<T, rusqlite::Error> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_column<T>(idx: usize, s: &str) -> Result<T, rusqlite::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp: {raw}").into(),
        )
    })
}

fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => timestamp_column(row, idx).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::payload::fixtures;
    use crate::model::TransactionalEntity;
    use crate::storage::Database;

    fn now() -> DateTime<Utc> {
        "2025-04-02T09:15:00Z".parse().unwrap()
    }

    fn vehicle(remote_id: &str, label: &str) -> ReferenceData {
        ReferenceData {
            remote_id: remote_id.to_string(),
            label: label.to_string(),
            active: true,
            fields: serde_json::json!({ "plate": label }),
        }
    }

    fn remote(remote_id: &str, liters: f64) -> RemoteRecord {
        RemoteRecord {
            remote_id: remote_id.to_string(),
            reference: Some(format!("DOT-{remote_id}")),
            payload: fixtures::dotation("trk-1", liters).into_payload(),
        }
    }

    #[tokio::test]
    async fn test_replace_references_keeps_local_ids() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = ReferenceKind::Vehicle;
                replace_references(conn, kind, &[vehicle("v1", "TRK-001"), vehicle("v2", "TRK-002")], now())?;
                let first = find_reference_by_remote_id(conn, kind, "v1")?.unwrap();

                let outcome = replace_references(
                    conn,
                    kind,
                    &[vehicle("v1", "TRK-001 (renamed)"), vehicle("v3", "TRK-003")],
                    now(),
                )?;
                assert_eq!(outcome, ReplaceOutcome { upserted: 2, pruned: 1 });

                let again = find_reference_by_remote_id(conn, kind, "v1")?.unwrap();
                assert_eq!(again.local_id, first.local_id);
                assert_eq!(again.label, "TRK-001 (renamed)");
                assert!(find_reference_by_remote_id(conn, kind, "v2")?.is_none());

                let all = list_references(conn, kind)?;
                assert_eq!(all.len(), 2);
                assert_eq!(get_reference(conn, kind, first.local_id)?.unwrap().fields["plate"], "TRK-001 (renamed)");

                // Other kinds are independent.
                assert!(list_references(conn, ReferenceKind::Driver)?.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_pending_with_queue() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let payload = fixtures::dotation("trk-7", 120.0).into_payload();
                let record = insert_pending_with_queue(conn, &payload, "key-1", now())?;

                assert!(record.pending_sync);
                assert!(record.created_offline);
                assert_eq!(
                    record.reference.as_deref(),
                    Some(format!("DOT-TMP-20250402-{}", record.local_id).as_str())
                );

                let stored = get_record(conn, TransactionalKind::FuelDotation, record.local_id)?.unwrap();
                assert_eq!(stored, record);

                let queue = list_queue(conn, false)?;
                assert_eq!(queue.len(), 1);
                assert_eq!(queue[0].entity_local_id, record.local_id);
                assert_eq!(queue[0].action, QueueAction::Create);
                assert_eq!(queue[0].payload, payload);
                assert_eq!(queue[0].idempotency_key, "key-1");
                assert_eq!(queue[0].retry_count, 0);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_open_create_is_refused() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let payload = fixtures::dotation("trk-7", 120.0).into_payload();
                let record = insert_pending_with_queue(conn, &payload, "key-1", now())?;
                let dup = insert_queue_item(conn, record.local_id, QueueAction::Create, None, &payload, "key-2", now());
                assert!(dup.is_err());
                assert_eq!(list_queue(conn, true)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_row_cannot_hold_remote_id() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let result = insert_record(
                    conn,
                    &NewRecord {
                        remote_id: Some("srv-1".into()),
                        reference: None,
                        payload: fixtures::breakdown("trk-1").into_payload(),
                        pending_sync: true,
                        created_offline: true,
                        created_at: now(),
                        synced_at: None,
                    },
                );
                assert!(result.is_err());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_is_atomic_and_keeps_local_id() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let payload = fixtures::dotation("trk-1", 50.0).into_payload();
                let record = insert_pending_with_queue(conn, &payload, "key-1", now())?;
                let item = find_open_create(conn, TransactionalKind::FuelDotation, record.local_id)?.unwrap();

                let outcome = reconcile(conn, &item, &remote("srv-9", 50.0), now())?;
                assert_eq!(outcome, ReconcileOutcome::Completed);

                let stored = get_record(conn, TransactionalKind::FuelDotation, record.local_id)?.unwrap();
                assert!(stored.is_reconciled());
                assert_eq!(stored.remote_id.as_deref(), Some("srv-9"));
                assert_eq!(stored.reference.as_deref(), Some("DOT-srv-9"));
                assert_eq!(stored.synced_at, Some(now()));
                assert!(stored.created_offline);
                assert!(list_queue(conn, true)?.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_folds_early_mirror() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let payload = fixtures::dotation("trk-1", 50.0).into_payload();
                let record = insert_pending_with_queue(conn, &payload, "key-1", now())?;
                let item = find_open_create(conn, TransactionalKind::FuelDotation, record.local_id)?.unwrap();

                // The server already has it and a listing mirrored it.
                upsert_remote_record(conn, &remote("srv-9", 50.0), now())?;
                reconcile(conn, &item, &remote("srv-9", 50.0), now())?;

                let all = list_records(conn, TransactionalKind::FuelDotation)?;
                assert_eq!(all.len(), 1);
                assert_eq!(all[0].local_id, record.local_id);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_merge_remote_list_never_touches_pending() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = TransactionalKind::FuelDotation;
                merge_remote_list(conn, kind, &[remote("a", 10.0), remote("b", 20.0)], now())?;
                let pending = insert_pending_with_queue(
                    conn,
                    &fixtures::dotation("trk-2", 5.0).into_payload(),
                    "key-1",
                    now(),
                )?;

                let outcome = merge_remote_list(conn, kind, &[remote("b", 25.0)], now())?;
                assert_eq!(outcome, MergeOutcome { upserted: 1, pruned: 1 });

                let all = list_records(conn, kind)?;
                assert_eq!(all.len(), 2);
                assert_eq!(all[0].local_id, pending.local_id, "pending rows come first");
                assert_eq!(all[1].remote_id.as_deref(), Some("b"));
                let data = all[1].clone().typed::<crate::model::FuelDotation>().unwrap().data;
                assert_eq!(data.liters, 25.0);

                assert_eq!(count_records(conn, kind)?, (2, 1));
                let reconciled = query_records(conn, kind, |r| r.is_reconciled())?;
                assert_eq!(reconciled.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_edit_pending_record_rewrites_create_item() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = TransactionalKind::FuelDotation;
                let record = insert_pending_with_queue(
                    conn,
                    &fixtures::dotation("trk-1", 40.0).into_payload(),
                    "key-1",
                    now(),
                )?;
                let before = find_open_create(conn, kind, record.local_id)?.unwrap();

                let edited = fixtures::dotation("trk-1", 45.0).into_payload();
                let outcome = edit_record_offline(conn, record.local_id, &edited, "key-2", now())?;
                assert!(matches!(outcome, RecordEdit::Pending(ref r) if r.payload == edited));

                let queue = list_queue(conn, true)?;
                assert_eq!(queue.len(), 1);
                assert_eq!(queue[0].id, before.id);
                assert_eq!(queue[0].idempotency_key, before.idempotency_key);
                assert_eq!(queue[0].payload, edited);

                assert_eq!(
                    edit_record_offline(conn, 9999, &edited, "key-3", now())?,
                    RecordEdit::NotFound
                );
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_edit_reconciled_record_queues_one_update() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = TransactionalKind::FuelDotation;
                let local_id = upsert_remote_record(conn, &remote("srv-1", 10.0), now())?;

                let first = fixtures::dotation("trk-1", 11.0).into_payload();
                let second = fixtures::dotation("trk-1", 12.0).into_payload();
                assert!(matches!(
                    edit_record_offline(conn, local_id, &first, "key-1", now())?,
                    RecordEdit::Queued(_)
                ));
                edit_record_offline(conn, local_id, &second, "key-2", now())?;

                let queue = list_queue(conn, true)?;
                assert_eq!(queue.len(), 1);
                assert_eq!(queue[0].action, QueueAction::Update);
                assert_eq!(queue[0].remote_id.as_deref(), Some("srv-1"));
                assert_eq!(queue[0].payload, second);
                assert_eq!(queue[0].idempotency_key, "key-2");

                let stored = get_record(conn, kind, local_id)?.unwrap();
                assert!(!stored.pending_sync);
                assert_eq!(stored.payload, second);

                // A listing must not overwrite the queued edit.
                merge_remote_list(conn, kind, &[remote("srv-1", 10.0)], now())?;
                assert_eq!(get_record(conn, kind, local_id)?.unwrap().payload, second);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_record_offline() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = TransactionalKind::FuelDotation;
                let pending = insert_pending_with_queue(
                    conn,
                    &fixtures::dotation("trk-1", 5.0).into_payload(),
                    "key-1",
                    now(),
                )?;
                assert_eq!(
                    delete_record_offline(conn, kind, pending.local_id, "key-2", now())?,
                    RecordRemoval::Discarded
                );
                assert!(list_queue(conn, true)?.is_empty());

                let local_id = upsert_remote_record(conn, &remote("srv-1", 10.0), now())?;
                assert_eq!(
                    delete_record_offline(conn, kind, local_id, "key-3", now())?,
                    RecordRemoval::Queued
                );
                assert!(get_record(conn, kind, local_id)?.is_none());
                let queue = list_queue(conn, true)?;
                assert_eq!(queue.len(), 1);
                assert_eq!(queue[0].action, QueueAction::Delete);
                assert_eq!(queue[0].remote_id.as_deref(), Some("srv-1"));

                // The server still lists it until the delete replays.
                merge_remote_list(conn, kind, &[remote("srv-1", 10.0)], now())?;
                assert!(list_records(conn, kind)?.is_empty());

                assert_eq!(
                    delete_record_offline(conn, kind, local_id, "key-4", now())?,
                    RecordRemoval::NotFound
                );
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_after_edit_in_flight() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = TransactionalKind::FuelDotation;
                let record = insert_pending_with_queue(
                    conn,
                    &fixtures::dotation("trk-1", 40.0).into_payload(),
                    "key-1",
                    now(),
                )?;
                let sent = find_open_create(conn, kind, record.local_id)?.unwrap();

                let edited = fixtures::dotation("trk-1", 41.0).into_payload();
                edit_record_offline(conn, record.local_id, &edited, "key-2", now())?;

                let outcome = reconcile(conn, &sent, &remote("srv-5", 40.0), now())?;
                assert_eq!(outcome, ReconcileOutcome::Superseded);

                let stored = get_record(conn, kind, record.local_id)?.unwrap();
                assert!(stored.is_reconciled());
                assert_eq!(stored.payload, edited);

                let queue = list_queue(conn, true)?;
                assert_eq!(queue.len(), 1);
                assert_eq!(queue[0].id, sent.id);
                assert_eq!(queue[0].action, QueueAction::Update);
                assert_eq!(queue[0].remote_id.as_deref(), Some("srv-5"));
                assert_eq!(queue[0].idempotency_key, "key-1:update");

                // Editing again replaces the update's content and its key.
                let again = fixtures::dotation("trk-1", 42.0).into_payload();
                edit_record_offline(conn, record.local_id, &again, "key-3", now())?;
                let queue = list_queue(conn, true)?;
                assert_eq!(queue.len(), 1);
                assert_eq!(queue[0].payload, again);
                assert_eq!(queue[0].idempotency_key, "key-3");
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_after_delete_in_flight() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = TransactionalKind::FuelDotation;
                let record = insert_pending_with_queue(
                    conn,
                    &fixtures::dotation("trk-1", 40.0).into_payload(),
                    "key-1",
                    now(),
                )?;
                let sent = find_open_create(conn, kind, record.local_id)?.unwrap();
                delete_record_offline(conn, kind, record.local_id, "key-2", now())?;

                let outcome = reconcile(conn, &sent, &remote("srv-5", 40.0), now())?;
                assert_eq!(outcome, ReconcileOutcome::Orphaned);
                assert!(list_records(conn, kind)?.is_empty());

                let queue = list_queue(conn, true)?;
                assert_eq!(queue.len(), 1);
                assert_eq!(queue[0].action, QueueAction::Delete);
                assert_eq!(queue[0].remote_id.as_deref(), Some("srv-5"));
                assert_eq!(queue[0].idempotency_key, "key-1:delete");
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_bookkeeping_and_stats() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let a = insert_pending_with_queue(conn, &fixtures::dotation("trk-1", 1.0).into_payload(), "k1", now())?;
                insert_pending_with_queue(conn, &fixtures::dotation("trk-1", 2.0).into_payload(), "k2", now())?;
                insert_pending_with_queue(conn, &fixtures::breakdown("trk-3").into_payload(), "k3", now())?;

                let item = find_open_create(conn, TransactionalKind::FuelDotation, a.local_id)?.unwrap();
                assert_eq!(record_queue_failure(conn, item.id, "timeout", now(), false)?, 1);
                assert_eq!(record_queue_failure(conn, item.id, "timeout again", now(), true)?, 2);

                let stored = get_queue_item(conn, item.id)?.unwrap();
                assert!(stored.parked);
                assert!(stored.is_failed());
                assert_eq!(stored.last_error.as_deref(), Some("timeout again"));
                assert_eq!(stored.last_attempt_at, Some(now()));

                assert_eq!(list_queue(conn, false)?.len(), 2);
                assert_eq!(list_queue(conn, true)?.len(), 3);
                assert_eq!(list_queue_for_kind(conn, TransactionalKind::FuelDotation, false)?.len(), 1);

                let stats = queue_stats(conn)?;
                assert_eq!(stats.pending, 3);
                assert_eq!(stats.failed, 1);
                assert_eq!(stats.parked, 1);
                assert_eq!(
                    stats.by_kind[&TransactionalKind::FuelDotation],
                    KindQueueStats { pending: 2, failed: 1 }
                );
                assert_eq!(
                    stats.by_kind[&TransactionalKind::Breakdown],
                    KindQueueStats { pending: 1, failed: 0 }
                );

                assert_eq!(unpark_failed(conn)?, 1);
                let stored = get_queue_item(conn, item.id)?.unwrap();
                assert!(!stored.parked);
                assert_eq!(stored.retry_count, 2);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clear_failed_removes_item_and_record() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = TransactionalKind::FuelDotation;
                let bad = insert_pending_with_queue(conn, &fixtures::dotation("trk-1", 1.0).into_payload(), "k1", now())?;
                let good = insert_pending_with_queue(conn, &fixtures::dotation("trk-1", 2.0).into_payload(), "k2", now())?;
                let item = find_open_create(conn, kind, bad.local_id)?.unwrap();
                record_queue_failure(conn, item.id, "500", now(), false)?;

                let outcome = clear_failed(conn)?;
                assert_eq!(outcome, ClearOutcome { items: 1, records: 1 });

                assert!(get_record(conn, kind, bad.local_id)?.is_none());
                assert!(get_record(conn, kind, good.local_id)?.is_some());
                let queue = list_queue(conn, true)?;
                assert_eq!(queue.len(), 1);
                assert_eq!(queue[0].entity_local_id, good.local_id);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_apply_remote_update_never_inserts() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = TransactionalKind::FuelDotation;
                let local_id = upsert_remote_record(conn, &remote("srv-1", 10.0), now())?;

                let stored = apply_remote_update(conn, kind, local_id, &remote("srv-1", 12.0), now())?
                    .unwrap();
                assert_eq!(stored.local_id, local_id);
                let liters = crate::model::FuelDotation::from_payload(stored.payload)
                    .unwrap()
                    .liters;
                assert_eq!(liters, 12.0);

                delete_record(conn, kind, local_id)?;
                assert!(apply_remote_update(conn, kind, local_id, &remote("srv-1", 13.0), now())?
                    .is_none());
                assert!(list_records(conn, kind)?.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_and_delete_record() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let kind = TransactionalKind::FuelDotation;
                let local_id = upsert_remote_record(conn, &remote("srv-1", 10.0), now())?;
                let mut record = get_record(conn, kind, local_id)?.unwrap();
                record.reference = Some("DOT-2025-0001".into());
                put_record(conn, &record)?;
                assert_eq!(
                    find_record_by_remote_id(conn, kind, "srv-1")?.unwrap().reference.as_deref(),
                    Some("DOT-2025-0001")
                );

                assert!(delete_record(conn, kind, local_id)?);
                assert!(!delete_record(conn, kind, local_id)?);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_meta_and_config() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                assert_eq!(get_meta(conn, "lastSync_vehicle")?, None);
                set_meta(conn, "lastSync_vehicle", &to_rfc3339(now()))?;
                assert_eq!(get_meta_timestamp(conn, "lastSync_vehicle")?, Some(now()));
                assert_eq!(list_meta(conn)?.len(), 1);

                set_config(conn, "debounce_ms", "1500")?;
                set_config(conn, "debounce_ms", "2500")?;
                assert_eq!(get_config(conn, "debounce_ms")?.as_deref(), Some("2500"));
                assert_eq!(list_config(conn)?, vec![("debounce_ms".to_string(), "2500".to_string())]);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
