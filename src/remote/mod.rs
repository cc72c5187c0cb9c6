//! Boundary to the server that owns record identity.
//!
//! The engine only sees [`RemoteApi`]. Every failure is classified as
//! transient (worth retrying later) or rejected (the server said no).

pub mod http;
pub mod mock;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::model::{RecordPayload, ReferenceData, ReferenceKind, TransactionalKind};

pub use http::HttpRemote;
pub use mock::MockRemote;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Connection refused, DNS failure, reset.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// 5xx, plus 408 and 429 which say "try again later".
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// A success status with a body we could not read.
    #[error("Undecodable response: {0}")]
    Decode(String),

    /// 4xx: validation or business-rule refusal. Retrying will not help.
    #[error("Rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, RemoteError::Rejected { .. })
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 => RemoteError::Server { status, message },
            400..=499 => RemoteError::Rejected { status, message },
            _ => RemoteError::Server { status, message },
        }
    }
}

/// The server's authoritative copy of an operational record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteRecord {
    pub remote_id: String,
    /// Server-assigned bon number, when the kind has one.
    pub reference: Option<String>,
    pub payload: RecordPayload,
}

/// Remote collaborator consumed by the façades, the queue processor and the
/// reference synchronizer.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Full server listing for a kind.
    async fn list(&self, kind: TransactionalKind) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Create a record. A repeated `idempotency_key` must return the record
    /// created the first time instead of a new one.
    async fn create(
        &self,
        payload: &RecordPayload,
        idempotency_key: &str,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Replace a record's fields wholesale.
    async fn update(
        &self,
        remote_id: &str,
        payload: &RecordPayload,
        idempotency_key: &str,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Delete a record. Implementations report an already-missing record as
    /// success.
    async fn delete(&self, kind: TransactionalKind, remote_id: &str) -> Result<(), RemoteError>;

    /// Server-side aggregates for a kind. Shape is owned by the server.
    async fn stats(&self, kind: TransactionalKind) -> Result<Value, RemoteError>;

    async fn fetch_reference(&self, kind: ReferenceKind) -> Result<Vec<ReferenceData>, RemoteError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Run a remote call under a deadline; expiry counts as a transient timeout.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout),
    }
}

// ── Wire decoding ──────────────────────────────────────────────────

/// Accept either a bare JSON array or an envelope `{ "data": [...] }`.
pub(crate) fn unwrap_list(body: Value) -> Result<Vec<Value>, RemoteError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(RemoteError::Decode("expected a list".into())),
        },
        _ => Err(RemoteError::Decode("expected a list".into())),
    }
}

/// Accept either a bare object or an envelope `{ "data": {...} }`.
pub(crate) fn unwrap_object(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.len() == 1 && map.get("data").is_some_and(Value::is_object) => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn id_field(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode one server record: `id`, optional `reference`, the rest is the body.
pub(crate) fn parse_record(kind: TransactionalKind, body: Value) -> Result<RemoteRecord, RemoteError> {
    let body = unwrap_object(body);
    let remote_id = id_field(&body)
        .ok_or_else(|| RemoteError::Decode(format!("{kind} record without an id")))?;
    let reference = ["reference", "bonNumber"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string);
    let payload = RecordPayload::from_body(kind, body)
        .map_err(|e| RemoteError::Decode(format!("{kind} record {remote_id}: {e}")))?;
    Ok(RemoteRecord {
        remote_id,
        reference,
        payload,
    })
}

/// Decode one reference entity: `id`, a display label, `active`, the rest as
/// free-form fields.
pub(crate) fn parse_reference(body: Value) -> Result<ReferenceData, RemoteError> {
    let remote_id =
        id_field(&body).ok_or_else(|| RemoteError::Decode("reference without an id".into()))?;
    let label = ["label", "name", "registration", "plate", "code"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| remote_id.clone());
    let active = body.get("active").and_then(Value::as_bool).unwrap_or(true);
    Ok(ReferenceData {
        remote_id,
        label,
        active,
        fields: body,
    })
}
