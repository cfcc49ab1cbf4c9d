//! Request/response bodies for the `POST /sync` HTTP transport and the
//! health endpoints.
//!
//! These are standalone structs, not [`Message`](super::Message) variants:
//! the HTTP transport exchanges one request body for one response body and
//! negotiates MsgPack or JSON by content type.

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;

use super::base::Operation;
use super::query::QueryRespPayload;
use super::search::SearchRespPayload;
use super::sync::{AckPayload, SyncDeltaPayload, SyncReqPayload};

/// One-shot query carried in a sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpQuery {
    /// Correlates the response entry to this request.
    pub request_id: String,
    /// Map to query.
    pub map_name: String,
    /// Filter, sort, and pagination.
    pub query: super::base::QuerySpec,
}

/// One-shot search carried in a sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSearch {
    /// Correlates the response entry to this request.
    pub request_id: String,
    /// Map whose index to search.
    pub map_name: String,
    /// The search itself.
    pub search_options: super::search::SearchOptions,
}

/// Body of `POST /sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSyncRequest {
    /// The calling client's stable id.
    pub client_id: String,
    /// The client's current HLC, folded into the server clock.
    pub client_hlc: Timestamp,
    /// Operations to push, ascending by oplog id.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operations: Option<Vec<Operation>>,
    /// Maps to pull deltas for.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sync_maps: Option<Vec<SyncReqPayload>>,
    /// One-shot queries.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub queries: Option<Vec<HttpQuery>>,
    /// One-shot searches.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub searches: Option<Vec<HttpSearch>>,
}

/// Body of the 200 response to `POST /sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSyncResponse {
    /// Server HLC after folding the client's clock and applying the push.
    pub server_hlc: Timestamp,
    /// Acknowledgment of the pushed operations, when any were sent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ack: Option<AckPayload>,
    /// Deltas for the requested maps.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deltas: Option<Vec<SyncDeltaPayload>>,
    /// One-shot query results, in request order.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub query_results: Option<Vec<QueryRespPayload>>,
    /// One-shot search results, in request order.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub search_results: Option<Vec<SearchRespPayload>>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the process can answer at all.
    pub status: String,
    /// Server wall time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Body of `GET /ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    /// True once the partition map has been loaded.
    pub ready: bool,
}
