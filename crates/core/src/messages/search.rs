//! Search domain payloads: BM25-backed subscriptions and responses.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Parameters of a full-text search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    /// Query text, tokenized server-side.
    pub query: String,
    /// Attribute to search; absent searches the indexed text of the whole
    /// value.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attribute: Option<String>,
    /// Page size; absent means server default.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u32>,
    /// Resume token from the previous page.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor: Option<String>,
}

/// Opens a live search subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSubPayload {
    /// Client-chosen subscription id (uuid).
    pub subscription_id: String,
    /// Map whose index to search.
    pub map_name: String,
    /// The search itself.
    pub search_options: SearchOptions,
}

/// Closes a live search subscription. Idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchUnsubPayload {
    /// Subscription to close.
    pub subscription_id: String,
}

/// One scored hit in a search response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    /// Primary key of the matching record.
    pub key: String,
    /// Its live value.
    pub value: Value,
    /// BM25 relevance.
    pub score: f64,
}

/// Initial snapshot (or page) for a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRespPayload {
    /// Subscription or one-shot request this answers.
    pub request_id: String,
    /// Hits in descending score order.
    pub results: Vec<SearchHit>,
    /// Resume token when more hits exist.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_cursor: Option<String>,
    /// Whether hits beyond this page exist.
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_resp_roundtrip() {
        let resp = SearchRespPayload {
            request_id: "req-9".into(),
            results: vec![SearchHit {
                key: "doc/1".into(),
                value: Value::from("body"),
                score: 2.5,
            }],
            next_cursor: Some("abc".into()),
            has_more: true,
        };
        let bytes = rmp_serde::to_vec_named(&resp).expect("serialize");
        let decoded: SearchRespPayload = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(resp, decoded);
    }
}
