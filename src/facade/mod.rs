//! Per-kind read/write entry point for application code.
//!
//! Online, calls go to the server first and the answer is mirrored locally.
//! Offline, or when the server is unreachable, the write lands in the local
//! store together with a queue item in one transaction, and the record is
//! returned straight away with `pending_sync = true`. A server rejection is
//! returned to the caller and nothing is written.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{StoredRecord, TransactionalEntity, TransactionalKind, TransactionalRecord};
use crate::network::NetworkMonitor;
use crate::remote::{bounded, RemoteApi, RemoteError};
use crate::storage::repository::{self, RecordEdit, RecordRemoval};
use crate::storage::{Database, LiveQuery, Table};

/// Aggregates for one kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Stats {
    /// Computed by the server; shape is server-defined.
    Remote { data: serde_json::Value },
    /// Counted from the local cache while the server is out of reach.
    Local { cached: u64, pending: u64 },
}

pub struct OfflineFacade<T> {
    db: Database,
    remote: Arc<dyn RemoteApi>,
    monitor: NetworkMonitor,
    request_timeout: Duration,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for OfflineFacade<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            remote: Arc::clone(&self.remote),
            monitor: self.monitor.clone(),
            request_timeout: self.request_timeout,
            _entity: PhantomData,
        }
    }
}

/// Remote failures worth falling back from. Rejections propagate.
fn fallback_or_reject(kind: TransactionalKind, op: &str, e: RemoteError) -> Result<()> {
    if e.is_transient() {
        log::warn!("Remote {op} of {kind} failed, working offline: {e}");
        Ok(())
    } else {
        Err(e.into())
    }
}

fn narrow<T: TransactionalEntity>(record: StoredRecord) -> Result<TransactionalRecord<T>> {
    let local_id = record.local_id;
    record
        .typed()
        .ok_or_else(|| Error::Other(format!("{} {local_id} holds another kind", T::KIND)))
}

fn record_tables(kind: TransactionalKind) -> [Table; 2] {
    [Table::Transactional(kind), Table::SyncQueue]
}

impl<T: TransactionalEntity> OfflineFacade<T> {
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteApi>,
        monitor: NetworkMonitor,
        request_timeout: Duration,
    ) -> Self {
        Self {
            db,
            remote,
            monitor,
            request_timeout,
            _entity: PhantomData,
        }
    }

    pub fn kind(&self) -> TransactionalKind {
        T::KIND
    }

    /// Pending records first, newest first within each group.
    ///
    /// Online, the server listing is merged into the cache before reading it
    /// back; a failed listing silently falls back to the cache.
    pub async fn list(&self) -> Result<Vec<TransactionalRecord<T>>> {
        if self.monitor.is_online() {
            match bounded(self.request_timeout, self.remote.list(T::KIND)).await {
                Ok(records) => {
                    let outcome = self
                        .db
                        .write(&[Table::Transactional(T::KIND)], move |conn| {
                            repository::merge_remote_list(conn, T::KIND, &records, Utc::now())
                        })
                        .await?;
                    log::debug!(
                        "Merged {} listing: {} upserted, {} pruned",
                        T::KIND,
                        outcome.upserted,
                        outcome.pruned
                    );
                }
                Err(e) => log::warn!("Listing {} from server failed, using cache: {e}", T::KIND),
            }
        }
        self.cached().await
    }

    /// The local cache only, pending records included.
    pub async fn cached(&self) -> Result<Vec<TransactionalRecord<T>>> {
        let rows = self
            .db
            .read(|conn| repository::list_records(conn, T::KIND))
            .await?;
        rows.into_iter().map(narrow::<T>).collect()
    }

    pub async fn get(&self, local_id: i64) -> Result<Option<TransactionalRecord<T>>> {
        let row = self
            .db
            .read(move |conn| repository::get_record(conn, T::KIND, local_id))
            .await?;
        row.map(narrow::<T>).transpose()
    }

    /// Create a record. Always returns a usable local record unless the
    /// server rejects it.
    pub async fn create(&self, input: T) -> Result<TransactionalRecord<T>> {
        let payload = input.into_payload();
        // The same key follows the record into the queue, so a create that
        // reached the server before timing out is not duplicated on replay.
        let key = Uuid::new_v4().to_string();

        if self.monitor.is_online() {
            match bounded(self.request_timeout, self.remote.create(&payload, &key)).await {
                Ok(remote) => {
                    let stored = self
                        .db
                        .write(&[Table::Transactional(T::KIND)], move |conn| {
                            let local_id = repository::upsert_remote_record(conn, &remote, Utc::now())?;
                            repository::get_record(conn, T::KIND, local_id)
                        })
                        .await?;
                    let stored = stored.ok_or_else(|| {
                        Error::Database(format!("{} vanished after mirroring", T::KIND))
                    })?;
                    return narrow(stored);
                }
                Err(e) => fallback_or_reject(T::KIND, "create", e)?,
            }
        }

        let stored = self
            .db
            .write(&record_tables(T::KIND), move |conn| {
                repository::insert_pending_with_queue(conn, &payload, &key, Utc::now())
            })
            .await?;
        log::info!("Queued {} {} for sync", T::KIND, stored.local_id);
        narrow(stored)
    }

    /// Replace a record's fields.
    pub async fn update(&self, local_id: i64, input: T) -> Result<TransactionalRecord<T>> {
        let payload = input.into_payload();
        let key = Uuid::new_v4().to_string();

        let (record, queued) = self
            .db
            .read(move |conn| {
                let record = repository::get_record(conn, T::KIND, local_id)?;
                let queued = repository::has_queued_work(conn, T::KIND, local_id)?;
                Ok((record, queued))
            })
            .await?;
        let record = record.ok_or_else(|| Error::NotFound(format!("{} {local_id}", T::KIND)))?;

        if let (Some(remote_id), false, true) =
            (record.remote_id.as_deref(), queued, self.monitor.is_online())
        {
            let call = self.remote.update(remote_id, &payload, &key);
            match bounded(self.request_timeout, call).await {
                Ok(remote) => {
                    let stored = self
                        .db
                        .write(&[Table::Transactional(T::KIND)], move |conn| {
                            repository::apply_remote_update(
                                conn,
                                T::KIND,
                                local_id,
                                &remote,
                                Utc::now(),
                            )
                        })
                        .await?;
                    // None: deleted locally while the call was in flight.
                    return match stored {
                        Some(stored) => narrow(stored),
                        None => Err(Error::NotFound(format!("{} {local_id}", T::KIND))),
                    };
                }
                Err(e) => fallback_or_reject(T::KIND, "update", e)?,
            }
        }

        let edit = self
            .db
            .write(&record_tables(T::KIND), move |conn| {
                repository::edit_record_offline(conn, local_id, &payload, &key, Utc::now())
            })
            .await?;
        match edit {
            RecordEdit::Pending(stored) | RecordEdit::Queued(stored) => narrow(stored),
            RecordEdit::NotFound => Err(Error::NotFound(format!("{} {local_id}", T::KIND))),
        }
    }

    /// Delete a record. A record the server never saw is simply discarded.
    pub async fn delete(&self, local_id: i64) -> Result<()> {
        let (record, queued) = self
            .db
            .read(move |conn| {
                let record = repository::get_record(conn, T::KIND, local_id)?;
                let queued = repository::has_queued_work(conn, T::KIND, local_id)?;
                Ok((record, queued))
            })
            .await?;
        let record = record.ok_or_else(|| Error::NotFound(format!("{} {local_id}", T::KIND)))?;

        if let (Some(remote_id), false, true) =
            (record.remote_id.as_deref(), queued, self.monitor.is_online())
        {
            match bounded(self.request_timeout, self.remote.delete(T::KIND, remote_id)).await {
                Ok(()) => {
                    self.db
                        .write(&[Table::Transactional(T::KIND)], move |conn| {
                            repository::delete_record(conn, T::KIND, local_id)
                        })
                        .await?;
                    return Ok(());
                }
                Err(e) => fallback_or_reject(T::KIND, "delete", e)?,
            }
        }

        let key = Uuid::new_v4().to_string();
        let removal = self
            .db
            .write(&record_tables(T::KIND), move |conn| {
                repository::delete_record_offline(conn, T::KIND, local_id, &key, Utc::now())
            })
            .await?;
        match removal {
            RecordRemoval::Discarded => {
                log::info!("Discarded unsent {} {local_id}", T::KIND);
                Ok(())
            }
            RecordRemoval::Queued => Ok(()),
            RecordRemoval::NotFound => Err(Error::NotFound(format!("{} {local_id}", T::KIND))),
        }
    }

    /// Server aggregates when reachable, local counts otherwise.
    pub async fn stats(&self) -> Result<Stats> {
        if self.monitor.is_online() {
            match bounded(self.request_timeout, self.remote.stats(T::KIND)).await {
                Ok(data) => return Ok(Stats::Remote { data }),
                Err(e) => log::warn!("Server stats for {} unavailable: {e}", T::KIND),
            }
        }
        let (cached, pending) = self
            .db
            .read(|conn| repository::count_records(conn, T::KIND))
            .await?;
        Ok(Stats::Local { cached, pending })
    }

    /// The cached list, kept current as the table changes.
    pub fn live(&self) -> LiveQuery<TransactionalRecord<T>> {
        self.db.live(&[Table::Transactional(T::KIND)], |conn| {
            let rows = repository::list_records(conn, T::KIND)?;
            Ok(rows.into_iter().filter_map(StoredRecord::typed).collect())
        })
    }
}
