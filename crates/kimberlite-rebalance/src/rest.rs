//! The local REST surface consumed by the core, plus the
//! error-string protocol.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::{IndexDefnId, IndexInstance, InstanceId};

/// Magic substrings the index HTTP layer uses to signal that a keyspace
/// (bucket/scope/collection) has disappeared. Treated as a non-fatal
/// "skip forward" signal everywhere they appear.
const MISSING_KEYSPACE_SIGNALS: &[&str] = &[
    "bucket not found",
    "scope not found",
    "collection not found",
]; // not exhaustive of every upstream phrasing, but the three this
   // protocol currently distinguishes.

/// Magic substring a batched build response uses to signal that the
/// index itself is gone, keyed by `defnId` rather than `instId`.
const INDEX_NOT_FOUND_SIGNAL: &str = "index not found for rebalance";

/// Classifies a response error string from the index HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The bucket/scope/collection is gone; treat as a no-op success and
    /// skip the token forward.
    MissingKeyspace,
    /// The index itself is gone (build-response-specific wording).
    IndexNotFound,
    /// Anything else: fatal, aborts the rebalance.
    Other,
}

/// The single place every magic-substring comparison in this crate goes
/// through.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains(INDEX_NOT_FOUND_SIGNAL) {
        return ErrorClass::IndexNotFound;
    }
    if MISSING_KEYSPACE_SIGNALS.iter().any(|s| lower.contains(s)) {
        return ErrorClass::MissingKeyspace;
    }
    ErrorClass::Other
}

/// Errors from a REST call to the local indexer surface.
#[derive(Debug, Error, Clone)]
pub enum RestError {
    /// The HTTP layer itself failed (connection refused, timeout, etc),
    /// as opposed to the indexer returning a well-formed error response.
    #[error("HTTP transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// Trailing-EOF / connection-close race. Worth its
    /// own variant so callers can retry exactly once.
    #[error("connection closed while calling {endpoint}")]
    TrailingEof { endpoint: String },

    /// The indexer returned `{Code: "error", Error: ...}` and the message
    /// did not match any recognised skip-forward signal.
    #[error("{endpoint} returned error: {message}")]
    Response { endpoint: String, message: String },
}

/// `{Code, Error}` response shape shared by create/build/drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleResponse {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Error", default)]
    pub error: String,
}

impl SimpleResponse {
    pub fn is_success(&self) -> bool {
        self.code == "success"
    }
}

/// A definition clone the destination POSTs to `/createIndexRebalance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefnClone {
    pub defn_id: IndexDefnId,
    pub inst_id: InstanceId,
    pub real_inst_id: InstanceId,
    pub deferred: bool,
    /// `true` when the clone has no node-restriction clause.
    pub unrestricted: bool,
}

/// Per-sub-error outcome of a batched `/buildIndexRebalance` call. The
/// response's `Error` field is either a bare magic string (marshal
/// failure, fatal) or a JSON map keyed by instance or definition id.
#[derive(Debug, Clone)]
pub enum BuildErrorPayload {
    /// Fatal: the response body itself could not be marshalled.
    Fatal(String),
    /// `{instId|defnId => message}`.
    PerToken(HashMap<String, String>),
}

/// Parses a `/buildIndexRebalance` error body per step 2.
pub fn parse_build_error(body: &str) -> BuildErrorPayload {
    match serde_json::from_str::<HashMap<String, String>>(body) {
        Ok(map) if !map.is_empty() => BuildErrorPayload::PerToken(map),
        _ => BuildErrorPayload::Fatal(body.to_string()),
    }
}

/// Flat stats map returned by `GET /stats`.
pub type StatsMap = HashMap<String, serde_json::Value>;

/// `GET /getLocalIndexMetadata` response shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocalIndexMetadata {
    #[serde(rename = "IndexDefinitions", default)]
    pub index_definitions: serde_json::Value,
    #[serde(rename = "IndexTopologies", default)]
    pub index_topologies: serde_json::Value,
}

/// One instance's entry in `GET /getIndexStatus?getAll=true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatusEntry {
    #[serde(rename = "InstId")]
    pub inst_id: InstanceId,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Progress")]
    pub progress: f64,
    #[serde(rename = "NodeUUID")]
    pub node_uuid: String,
}

/// The REST surface the destination/source handlers call against the
/// local node. `async-trait` lets this be stored behind
/// `Arc<dyn IndexerRestClient>` so tests can substitute
/// [`MockIndexerClient`].
#[async_trait]
pub trait IndexerRestClient: Send + Sync {
    async fn create_index_rebalance(&self, defn: &IndexDefnClone) -> Result<SimpleResponse, RestError>;

    async fn build_index_rebalance(&self, defn_ids: &[IndexDefnId]) -> Result<SimpleResponse, RestError>;

    async fn drop_index(&self, inst: &IndexInstance) -> Result<SimpleResponse, RestError>;

    async fn stats(&self, partition: bool) -> Result<StatsMap, RestError>;

    async fn local_index_metadata(&self) -> Result<LocalIndexMetadata, RestError>;

    async fn index_status(&self) -> Result<Vec<IndexStatusEntry>, RestError>;
}

/// A `reqwest`-backed client talking to the indexer's loopback REST
/// surface on this node.
pub struct ReqwestIndexerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ReqwestIndexerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with default TLS backend"),
        }
    }

    /// POSTs `body` to `path`, retrying exactly once on a trailing-EOF
    /// style transport error.
    async fn post_with_eof_retry<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<SimpleResponse, RestError> {
        match self.post_once(path, body).await {
            Err(RestError::TrailingEof { .. }) => self.post_once(path, body).await,
            other => other,
        }
    }

    async fn post_once<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<SimpleResponse, RestError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.post(&url).json(body).send().await.map_err(|e| {
            if e.is_connect() || e.is_request() {
                RestError::TrailingEof { endpoint: path.to_string() }
            } else {
                RestError::Transport { endpoint: path.to_string(), message: e.to_string() }
            }
        })?;
        resp.json::<SimpleResponse>().await.map_err(|e| RestError::Transport {
            endpoint: path.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl IndexerRestClient for ReqwestIndexerClient {
    async fn create_index_rebalance(&self, defn: &IndexDefnClone) -> Result<SimpleResponse, RestError> {
        #[derive(Serialize)]
        struct Body<'a> {
            #[serde(rename = "Index")]
            index: &'a IndexDefnClone,
        }
        self.post_with_eof_retry("/createIndexRebalance", &Body { index: defn }).await
    }

    async fn build_index_rebalance(&self, defn_ids: &[IndexDefnId]) -> Result<SimpleResponse, RestError> {
        #[derive(Serialize)]
        struct IndexIds {
            #[serde(rename = "defnIds")]
            defn_ids: Vec<IndexDefnId>,
        }
        #[derive(Serialize)]
        struct Body {
            #[serde(rename = "IndexIds")]
            index_ids: IndexIds,
        }
        self.post_with_eof_retry(
            "/buildIndexRebalance",
            &Body { index_ids: IndexIds { defn_ids: defn_ids.to_vec() } },
        )
        .await
    }

    async fn drop_index(&self, inst: &IndexInstance) -> Result<SimpleResponse, RestError> {
        #[derive(Serialize)]
        struct Body<'a> {
            #[serde(rename = "Index")]
            index: &'a IndexInstance,
        }
        self.post_with_eof_retry("/dropIndex", &Body { index: inst }).await
    }

    async fn stats(&self, partition: bool) -> Result<StatsMap, RestError> {
        let mut url = format!("{}/stats?async=true&consumerFilter=rebalancer", self.base_url);
        if partition {
            url.push_str("&partition=true");
        }
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RestError::Transport { endpoint: "/stats".into(), message: e.to_string() })?;
        resp.json().await.map_err(|e| RestError::Transport { endpoint: "/stats".into(), message: e.to_string() })
    }

    async fn local_index_metadata(&self) -> Result<LocalIndexMetadata, RestError> {
        let url = format!("{}/getLocalIndexMetadata?useETag=false", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(|e| RestError::Transport {
            endpoint: "/getLocalIndexMetadata".into(),
            message: e.to_string(),
        })?;
        resp.json().await.map_err(|e| RestError::Transport {
            endpoint: "/getLocalIndexMetadata".into(),
            message: e.to_string(),
        })
    }

    async fn index_status(&self) -> Result<Vec<IndexStatusEntry>, RestError> {
        let url = format!("{}/getIndexStatus?getAll=true", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(|e| RestError::Transport {
            endpoint: "/getIndexStatus".into(),
            message: e.to_string(),
        })?;
        resp.json().await.map_err(|e| RestError::Transport {
            endpoint: "/getIndexStatus".into(),
            message: e.to_string(),
        })
    }
}
