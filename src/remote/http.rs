use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use url::Url;

use super::{parse_record, parse_reference, unwrap_list, RemoteApi, RemoteError, RemoteRecord};
use crate::error::{Error, Result};
use crate::model::{RecordPayload, ReferenceData, ReferenceKind, TransactionalKind};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const MAX_ERROR_MESSAGE: usize = 240;

/// JSON-over-HTTP implementation of [`RemoteApi`].
///
/// Collections live at `<base>/<resource>` (e.g. `/fuel-dotations`,
/// `/vehicles`), single records at `<base>/<resource>/<id>`, aggregates at
/// `<base>/<resource>/stats` and the reachability check at `<base>/health`.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base_url: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("fleetsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to construct HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            token: token.filter(|t| !t.is_empty()),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::Network(format!("invalid endpoint {path}: {e}")))
    }

    fn request(&self, method: Method, path: &str) -> std::result::Result<reqwest::RequestBuilder, RemoteError> {
        let request = self.client.request(method, self.endpoint(path)?);
        Ok(match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> std::result::Result<Value, RemoteError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            let bytes = response.bytes().await.map_err(transport_error)?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(
            status.as_u16(),
            error_message(&body, status),
        ))
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn list(&self, kind: TransactionalKind) -> std::result::Result<Vec<RemoteRecord>, RemoteError> {
        let body = self.send(self.request(Method::GET, kind.resource())?).await?;
        unwrap_list(body)?
            .into_iter()
            .map(|item| parse_record(kind, item))
            .collect()
    }

    async fn create(
        &self,
        payload: &RecordPayload,
        idempotency_key: &str,
    ) -> std::result::Result<RemoteRecord, RemoteError> {
        let kind = payload.kind();
        let body = payload.body().map_err(|e| RemoteError::Decode(e.to_string()))?;
        let request = self
            .request(Method::POST, kind.resource())?
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(&body);
        parse_record(kind, self.send(request).await?)
    }

    async fn update(
        &self,
        remote_id: &str,
        payload: &RecordPayload,
        idempotency_key: &str,
    ) -> std::result::Result<RemoteRecord, RemoteError> {
        let kind = payload.kind();
        let body = payload.body().map_err(|e| RemoteError::Decode(e.to_string()))?;
        let request = self
            .request(Method::PUT, &format!("{}/{remote_id}", kind.resource()))?
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(&body);
        match self.send(request).await? {
            // Some servers answer 204 to a PUT; the submitted body then stands.
            Value::Null => Ok(RemoteRecord {
                remote_id: remote_id.to_string(),
                reference: None,
                payload: payload.clone(),
            }),
            body => parse_record(kind, body),
        }
    }

    async fn delete(&self, kind: TransactionalKind, remote_id: &str) -> std::result::Result<(), RemoteError> {
        let request = self.request(Method::DELETE, &format!("{}/{remote_id}", kind.resource()))?;
        match self.send(request).await {
            Ok(_) => Ok(()),
            Err(RemoteError::Rejected { status: 404, .. }) => {
                log::debug!("{kind} {remote_id} already gone on the server");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stats(&self, kind: TransactionalKind) -> std::result::Result<Value, RemoteError> {
        self.send(self.request(Method::GET, &format!("{}/stats", kind.resource()))?)
            .await
    }

    async fn fetch_reference(
        &self,
        kind: ReferenceKind,
    ) -> std::result::Result<Vec<ReferenceData>, RemoteError> {
        let body = self.send(self.request(Method::GET, kind.resource())?).await?;
        unwrap_list(body)?.into_iter().map(parse_reference).collect()
    }

    async fn ping(&self) -> std::result::Result<(), RemoteError> {
        self.send(self.request(Method::GET, "health")?).await.map(|_| ())
    }
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Config("API base URL must not be empty".into()));
    }
    // A trailing slash makes `join` append instead of replacing the last segment.
    let with_slash = format!("{}/", trimmed.trim_end_matches('/'));
    let url = Url::parse(&with_slash)
        .map_err(|e| Error::Config(format!("invalid API base URL {trimmed}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::Config(format!(
            "API base URL must use http or https, got {other}"
        ))),
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else if e.is_decode() {
        RemoteError::Decode(e.to_string())
    } else {
        RemoteError::Network(e.to_string())
    }
}

/// Prefer the server's `message`/`error` field; fall back to the raw body.
fn error_message(body: &str, status: StatusCode) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["message", "error", "detail"]
            .iter()
            .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_string))
    });
    let message = from_json.unwrap_or_else(|| body.split_whitespace().collect::<Vec<_>>().join(" "));
    if message.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
    }
    message.chars().take(MAX_ERROR_MESSAGE).collect()
}
