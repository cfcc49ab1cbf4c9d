//! Opaque pagination cursors.
//!
//! A cursor encodes the last emitted row's sort-key vector plus its primary
//! key as the final tiebreaker, so pagination is stable under inserts that
//! sort before the cursor, deletes elsewhere, and duplicate sort keys.
//! Offset/limit pagination is deliberately not offered: merging local and
//! server pages double-applies offsets.
//!
//! Tokens are named-MsgPack, base64url-encoded. Clients treat them as
//! opaque; decoding rejects anything malformed.

use std::cmp::Ordering;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::predicate::{SortDirection, SortSpec};
use crate::value::Value;

/// The virtual relevance attribute, sortable in search queries.
pub const SCORE_ATTRIBUTE: &str = "_score";

/// Decoded cursor state: where the previous page ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// The last row's sort-key vector, one entry per sort spec.
    pub sort_keys: Vec<Value>,
    /// The last row's primary key, the final tiebreaker.
    pub primary_key: String,
}

/// A cursor token failed to decode.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("cursor token is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("cursor token payload is malformed")]
    Payload(#[from] rmp_serde::decode::Error),
}

impl Cursor {
    /// Encodes the cursor to its opaque token form.
    #[must_use]
    pub fn encode(&self) -> String {
        let bytes = rmp_serde::to_vec_named(self).expect("cursor serialization is infallible");
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Decodes an opaque token.
    ///
    /// # Errors
    ///
    /// [`CursorError`] when the token is not base64 or not a cursor payload.
    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD.decode(token)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }
}

/// Extracts a row's sort-key vector for the given sort specs.
///
/// `_score` reads from the `score` argument (zero when absent); every other
/// attribute reads from the row, with missing attributes keyed as null so
/// they sort first ascending.
#[must_use]
pub fn sort_vector(row: &Value, score: Option<f64>, specs: &[SortSpec]) -> Vec<Value> {
    specs
        .iter()
        .map(|spec| {
            if spec.attribute == SCORE_ATTRIBUTE {
                Value::Float(score.unwrap_or(0.0))
            } else {
                row.attribute(&spec.attribute).cloned().unwrap_or(Value::Null)
            }
        })
        .collect()
}

/// Compares two rows by their sort-key vectors under the sort specs, with
/// the primary key ascending as the final tiebreaker.
#[must_use]
pub fn compare_rows(
    a: (&[Value], &str),
    b: (&[Value], &str),
    specs: &[SortSpec],
) -> Ordering {
    for (index, spec) in specs.iter().enumerate() {
        let left = a.0.get(index).unwrap_or(&Value::Null);
        let right = b.0.get(index).unwrap_or(&Value::Null);
        let ordering = match spec.direction {
            SortDirection::Asc => left.cmp_sort(right),
            SortDirection::Desc => right.cmp_sort(left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.1.cmp(b.1)
}

/// Whether a row sorts strictly after the cursor position.
#[must_use]
pub fn row_is_after_cursor(
    cursor: &Cursor,
    row_keys: &[Value],
    row_primary: &str,
    specs: &[SortSpec],
) -> bool {
    compare_rows(
        (row_keys, row_primary),
        (&cursor.sort_keys, &cursor.primary_key),
        specs,
    ) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(score: i64) -> Value {
        Value::Map(
            [("score".to_string(), Value::Int(score))]
                .into_iter()
                .collect(),
        )
    }

    fn asc(attribute: &str) -> SortSpec {
        SortSpec {
            attribute: attribute.to_string(),
            direction: SortDirection::Asc,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let cursor = Cursor {
            sort_keys: vec![Value::Int(3), Value::from("abc")],
            primary_key: "item/3".to_string(),
        };
        let token = cursor.encode();
        assert_eq!(Cursor::decode(&token).unwrap(), cursor);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Cursor::decode("!!!not-base64!!!").is_err());
        let valid_b64 = URL_SAFE_NO_PAD.encode(b"not a cursor");
        assert!(Cursor::decode(&valid_b64).is_err());
    }

    #[test]
    fn sort_vector_reads_attributes_and_score() {
        let specs = vec![asc("score"), asc(SCORE_ATTRIBUTE), asc("missing")];
        let keys = sort_vector(&row(7), Some(0.5), &specs);
        assert_eq!(
            keys,
            vec![Value::Int(7), Value::Float(0.5), Value::Null]
        );
    }

    #[test]
    fn compare_rows_respects_direction_and_tiebreak() {
        let specs = vec![SortSpec {
            attribute: "score".into(),
            direction: SortDirection::Desc,
        }];
        let high = [Value::Int(9)];
        let low = [Value::Int(1)];
        assert_eq!(
            compare_rows((&high, "a"), (&low, "b"), &specs),
            Ordering::Less,
            "descending: higher score sorts first"
        );
        // Equal sort keys fall through to the primary key, ascending.
        let same = [Value::Int(5)];
        assert_eq!(
            compare_rows((&same, "a"), (&same, "b"), &specs),
            Ordering::Less
        );
    }

    #[test]
    fn rows_after_cursor_are_strictly_after() {
        let specs = vec![asc("score")];
        let cursor = Cursor {
            sort_keys: vec![Value::Int(2)],
            primary_key: "item/2".to_string(),
        };
        assert!(row_is_after_cursor(
            &cursor,
            &[Value::Int(3)],
            "item/3",
            &specs
        ));
        // The cursor row itself is excluded.
        assert!(!row_is_after_cursor(
            &cursor,
            &[Value::Int(2)],
            "item/2",
            &specs
        ));
        assert!(!row_is_after_cursor(
            &cursor,
            &[Value::Int(1)],
            "item/1",
            &specs
        ));
        // Duplicate sort key: primary key breaks the tie.
        assert!(row_is_after_cursor(
            &cursor,
            &[Value::Int(2)],
            "item/9",
            &specs
        ));
    }
}
