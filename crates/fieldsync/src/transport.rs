//! HTTP transport for the sync protocol
//!
//! Uses synchronous HTTP (ureq) to be executor-agnostic. The trait is
//! what the engine and cache service program against; the ureq
//! implementation talks to the server of record. Failures are split
//! into the two classes the queue state machine cares about: transient
//! (retry with backoff) and rejected (permanent, needs manual
//! resolution).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::config::ApiCredentials;
use crate::models::{EntityRecord, MutationEntry, MutationOp};

/// Transport failure classification
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Network/server hiccup; the same request may succeed later
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// The server understood and refused; retrying will not help
    #[error("server rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Whether an HTTP status code is worth retrying
fn status_is_transient(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..=599).contains(&status)
}

fn error_from_status(status: u16) -> TransportError {
    if status_is_transient(status) {
        TransportError::Transient(format!("server returned status {status}"))
    } else {
        TransportError::Rejected {
            status,
            message: format!("server returned status {status}"),
        }
    }
}

fn transient(err: impl std::fmt::Display) -> TransportError {
    TransportError::Transient(err.to_string())
}

fn default_true() -> bool {
    true
}

/// One record as the server sends it: envelope fields plus whatever
/// business fields the entity carries, which stay opaque JSON here
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Remaining business fields
    #[serde(flatten)]
    pub data: Value,
}

impl RemoteRecord {
    /// Convert into a cached row confirmed by the server at `synced_at`
    pub fn into_record(self, synced_at: DateTime<Utc>) -> EntityRecord {
        EntityRecord {
            id: self.id,
            data: self.data,
            created_at: self.created_at,
            updated_at: self.updated_at,
            synced_at: Some(synced_at),
            is_active: self.is_active,
        }
    }
}

/// One page of an incremental change feed
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePage {
    #[serde(default)]
    pub records: Vec<RemoteRecord>,
    /// Continuation token; `None` when this is the last page
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Server API abstraction used by the engine and the cache service
pub trait ApiTransport: Send + Sync {
    /// Fetch one page of records changed since `updated_since`
    fn list_changes(
        &self,
        endpoint: &str,
        updated_since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ChangePage, TransportError>;

    /// Fetch a single record, `None` if the server has no such id
    fn fetch_record(&self, endpoint: &str, id: &str)
    -> Result<Option<RemoteRecord>, TransportError>;

    /// Push one queued mutation to the server
    fn push_mutation(&self, endpoint: &str, entry: &MutationEntry) -> Result<(), TransportError>;

    /// Apply a server-side write immediately (write-through for
    /// server-authoritative entities); returns the updated record
    fn write_through(
        &self,
        endpoint: &str,
        id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, TransportError>;
}

/// Supplies the bearer token injected into each request.
///
/// Token refresh is owned by the external auth collaborator; this
/// crate only asks for the current token.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<String, TransportError>;
}

/// Fixed token, for sessions where the caller refreshes credentials by
/// rebuilding the transport
pub struct StaticTokenProvider(pub String);

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Result<String, TransportError> {
        Ok(self.0.clone())
    }
}

/// ureq-backed implementation of [`ApiTransport`]
pub struct HttpTransport {
    base_url: String,
    auth: Arc<dyn TokenProvider>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn TokenProvider>) -> Self {
        Self {
            base_url: base_url.into(),
            auth,
        }
    }

    /// Build a transport with a fixed token from loaded credentials
    pub fn from_credentials(creds: ApiCredentials) -> Self {
        Self::new(creds.base_url, Arc::new(StaticTokenProvider(creds.token)))
    }

    fn endpoint_url(&self, endpoint: &str, id: Option<&str>) -> Result<Url, TransportError> {
        let mut raw = format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint);
        if let Some(id) = id {
            raw.push('/');
            raw.push_str(id);
        }
        Url::parse(&raw).map_err(|e| TransportError::Rejected {
            status: 0,
            message: format!("invalid endpoint url {raw:?}: {e}"),
        })
    }

    fn bearer(&self) -> Result<String, TransportError> {
        Ok(format!("Bearer {}", self.auth.token()?))
    }
}

impl ApiTransport for HttpTransport {
    fn list_changes(
        &self,
        endpoint: &str,
        updated_since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ChangePage, TransportError> {
        let mut url = self.endpoint_url(endpoint, None)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pageSize", &page_size.to_string());
            if let Some(since) = updated_since {
                query.append_pair("updatedSince", &since.to_rfc3339());
            }
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let mut response = ureq::get(url.as_str())
            .header("Authorization", &self.bearer()?)
            .call()
            .map_err(classify_ureq)?;

        response.body_mut().read_json().map_err(transient)
    }

    fn fetch_record(
        &self,
        endpoint: &str,
        id: &str,
    ) -> Result<Option<RemoteRecord>, TransportError> {
        let url = self.endpoint_url(endpoint, Some(id))?;
        let response = ureq::get(url.as_str())
            .header("Authorization", &self.bearer()?)
            .call();

        match response {
            Ok(mut resp) => {
                let record: RemoteRecord = resp.body_mut().read_json().map_err(transient)?;
                Ok(Some(record))
            }
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(e) => Err(classify_ureq(e)),
        }
    }

    fn push_mutation(&self, endpoint: &str, entry: &MutationEntry) -> Result<(), TransportError> {
        let auth = self.bearer()?;
        let result = match entry.op {
            MutationOp::Create => {
                // The server keeps the client-generated id so the row
                // needs no id rewrite after confirmation.
                let mut body = entry.payload.clone();
                if let Some(map) = body.as_object_mut() {
                    map.insert("id".into(), Value::String(entry.entity_id.clone()));
                }
                let url = self.endpoint_url(endpoint, None)?;
                ureq::post(url.as_str())
                    .header("Authorization", &auth)
                    .send_json(&body)
            }
            MutationOp::Update => {
                let url = self.endpoint_url(endpoint, Some(&entry.entity_id))?;
                ureq::patch(url.as_str())
                    .header("Authorization", &auth)
                    .send_json(&entry.payload)
            }
            MutationOp::Delete => {
                let url = self.endpoint_url(endpoint, Some(&entry.entity_id))?;
                match ureq::delete(url.as_str()).header("Authorization", &auth).call() {
                    // Already gone server-side counts as applied
                    Err(ureq::Error::StatusCode(404)) => return Ok(()),
                    other => other,
                }
            }
        };

        result.map(|_| ()).map_err(classify_ureq)
    }

    fn write_through(
        &self,
        endpoint: &str,
        id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, TransportError> {
        let url = self.endpoint_url(endpoint, Some(id))?;
        let mut response = ureq::patch(url.as_str())
            .header("Authorization", &self.bearer()?)
            .send_json(payload)
            .map_err(classify_ureq)?;

        response.body_mut().read_json().map_err(transient)
    }
}

/// Map a ureq error into the transport taxonomy
fn classify_ureq(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::StatusCode(code) => error_from_status(code),
        // Connection refused, DNS failure, timeout, TLS trouble: all
        // worth retrying once connectivity returns
        other => TransportError::Transient(other.to_string()),
    }
}
