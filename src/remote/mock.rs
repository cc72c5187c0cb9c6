//! In-memory server double.
//!
//! Behaves like a well-mannered server: assigns ids and bon numbers, honours
//! idempotency keys on creates and updates, treats deletes of missing records as success. Failures
//! and latency are scriptable so engine behaviour can be exercised without a
//! network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{RemoteApi, RemoteError, RemoteRecord};
use crate::model::{RecordPayload, ReferenceData, ReferenceKind, TransactionalKind};

/// Price per liter the double uses to fill in server-computed fuel costs.
pub const MOCK_FUEL_PRICE: f64 = 45.0;

#[derive(Default)]
struct MockState {
    records: BTreeMap<TransactionalKind, Vec<RemoteRecord>>,
    references: HashMap<ReferenceKind, Vec<ReferenceData>>,
    by_idempotency_key: HashMap<String, RemoteRecord>,
    updates_by_key: HashMap<String, RemoteRecord>,
    scripted: VecDeque<RemoteError>,
    next_id: u64,
}

pub struct MockRemote {
    state: Mutex<MockState>,
    available: AtomicBool,
    latency: Mutex<Option<Duration>>,
    create_calls: AtomicU32,
    update_calls: AtomicU32,
    delete_calls: AtomicU32,
    list_calls: AtomicU32,
    reference_calls: AtomicU32,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            available: AtomicBool::new(true),
            latency: Mutex::new(None),
            create_calls: AtomicU32::new(0),
            update_calls: AtomicU32::new(0),
            delete_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            reference_calls: AtomicU32::new(0),
        }
    }

    /// Start unreachable.
    pub fn offline() -> Self {
        let mock = Self::new();
        mock.set_available(false);
        mock
    }

    /// Seed reference data served by `fetch_reference`.
    pub fn with_references(self, kind: ReferenceKind, rows: Vec<ReferenceData>) -> Self {
        self.set_references(kind, rows);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Delay every call (except `ping`) by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Fail the next non-ping calls, in order, with these errors.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = RemoteError>) {
        lock(&self.state).scripted.extend(errors);
    }

    pub fn set_references(&self, kind: ReferenceKind, rows: Vec<ReferenceData>) {
        lock(&self.state).references.insert(kind, rows);
    }

    /// Insert a record as if another client had created it.
    pub fn seed(&self, payload: RecordPayload) -> RemoteRecord {
        let mut state = lock(&self.state);
        insert_record(&mut state, payload)
    }

    /// Delete a record as if another client had removed it.
    pub fn remove(&self, kind: TransactionalKind, remote_id: &str) -> bool {
        let mut state = lock(&self.state);
        let records = state.records.entry(kind).or_default();
        let before = records.len();
        records.retain(|r| r.remote_id != remote_id);
        records.len() != before
    }

    pub fn records(&self, kind: TransactionalKind) -> Vec<RemoteRecord> {
        lock(&self.state)
            .records
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn reference_calls(&self) -> u32 {
        self.reference_calls.load(Ordering::SeqCst)
    }

    /// Common prologue: latency, reachability, scripted failures.
    async fn enter(&self) -> Result<(), RemoteError> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.is_available() {
            return Err(RemoteError::Network("connection refused".into()));
        }
        match lock(&self.state).scripted.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panicking test thread must not cascade into every other assertion.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fill in what a real server computes.
fn server_side(payload: RecordPayload) -> RecordPayload {
    match payload {
        RecordPayload::FuelDotation(mut d) => {
            d.total_cost = Some(d.liters * MOCK_FUEL_PRICE);
            RecordPayload::FuelDotation(d)
        }
        other => other,
    }
}

fn insert_record(state: &mut MockState, payload: RecordPayload) -> RemoteRecord {
    state.next_id += 1;
    let id = state.next_id;
    let kind = payload.kind();
    let record = RemoteRecord {
        remote_id: format!("srv-{id}"),
        reference: kind.reference_prefix().map(|p| format!("{p}-{id:06}")),
        payload: server_side(payload),
    };
    state.records.entry(kind).or_default().push(record.clone());
    record
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn list(&self, kind: TransactionalKind) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self.records(kind))
    }

    async fn create(
        &self,
        payload: &RecordPayload,
        idempotency_key: &str,
    ) -> Result<RemoteRecord, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let mut state = lock(&self.state);
        if let Some(existing) = state.by_idempotency_key.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let record = insert_record(&mut state, payload.clone());
        state
            .by_idempotency_key
            .insert(idempotency_key.to_string(), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        remote_id: &str,
        payload: &RecordPayload,
        idempotency_key: &str,
    ) -> Result<RemoteRecord, RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let mut state = lock(&self.state);
        // A replayed key gets the first answer back and changes nothing.
        if let Some(answered) = state.updates_by_key.get(idempotency_key) {
            return Ok(answered.clone());
        }
        let records = state.records.entry(payload.kind()).or_default();
        let Some(existing) = records.iter_mut().find(|r| r.remote_id == remote_id) else {
            return Err(RemoteError::Rejected {
                status: 404,
                message: format!("{} {remote_id} not found", payload.kind()),
            });
        };
        existing.payload = server_side(payload.clone());
        let answer = existing.clone();
        state
            .updates_by_key
            .insert(idempotency_key.to_string(), answer.clone());
        Ok(answer)
    }

    async fn delete(&self, kind: TransactionalKind, remote_id: &str) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        self.remove(kind, remote_id);
        Ok(())
    }

    async fn stats(&self, kind: TransactionalKind) -> Result<Value, RemoteError> {
        self.enter().await?;
        Ok(json!({ "kind": kind.as_str(), "total": self.records(kind).len() }))
    }

    async fn fetch_reference(&self, kind: ReferenceKind) -> Result<Vec<ReferenceData>, RemoteError> {
        self.reference_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(lock(&self.state)
            .references
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RemoteError::Network("connection refused".into()))
        }
    }
}
