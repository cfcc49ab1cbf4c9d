//! Query domain payloads: subscriptions, responses, and live deltas.

use serde::{Deserialize, Serialize};

use crate::value::Value;

use super::base::QuerySpec;

/// Kind of a live subscription delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaKind {
    /// Key newly matches the subscription.
    Enter,
    /// Key still matches; value or score changed.
    Update,
    /// Key no longer matches.
    Leave,
}

/// Opens a live query subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySubPayload {
    /// Client-chosen subscription id (uuid).
    pub subscription_id: String,
    /// Map to query.
    pub map_name: String,
    /// Filter, sort, and pagination.
    pub query: QuerySpec,
}

/// Closes a live query subscription. Idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryUnsubPayload {
    /// Subscription to close.
    pub subscription_id: String,
}

/// One row in a query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRow {
    /// Primary key of the matching record.
    pub key: String,
    /// Its live value.
    pub value: Value,
}

/// Initial snapshot (or page) for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRespPayload {
    /// Subscription or one-shot request this answers.
    pub request_id: String,
    /// Matching rows in sort order.
    pub results: Vec<QueryRow>,
    /// Resume token when more rows exist.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next_cursor: Option<String>,
    /// Whether rows beyond this page exist.
    pub has_more: bool,
}

/// A live delta for a query or search subscription.
///
/// Deltas are strictly ordered per subscription id; a `LEAVE` is only ever
/// preceded by an `ENTER` for the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDelta {
    /// Subscription the delta belongs to.
    pub subscription_id: String,
    /// Enter, update, or leave.
    #[serde(rename = "type")]
    pub kind: DeltaKind,
    /// Affected key.
    pub key: String,
    /// New value for enter/update; absent on leave.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
    /// New relevance score, search subscriptions only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_kind_wire_names() {
        let bytes = rmp_serde::to_vec_named(&DeltaKind::Enter).unwrap();
        let s: String = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(s, "ENTER");
    }

    #[test]
    fn subscription_delta_roundtrip() {
        let delta = SubscriptionDelta {
            subscription_id: "sub-1".into(),
            kind: DeltaKind::Update,
            key: "user/1".into(),
            value: Some(Value::Int(4)),
            score: Some(1.25),
        };
        let bytes = rmp_serde::to_vec_named(&delta).expect("serialize");
        let decoded: SubscriptionDelta = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(delta, decoded);
    }

    #[test]
    fn delta_type_field_is_named_type() {
        let delta = SubscriptionDelta {
            subscription_id: "s".into(),
            kind: DeltaKind::Leave,
            key: "k".into(),
            value: None,
            score: None,
        };
        let json = serde_json::to_value(&delta).expect("serialize");
        assert_eq!(json.get("type").and_then(|v| v.as_str()), Some("LEAVE"));
    }
}
