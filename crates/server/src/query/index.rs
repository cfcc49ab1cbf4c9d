//! Per-map full-text index catalog.
//!
//! Keeps one BM25 [`TextIndex`] per map, fed from change events. The
//! indexed text of a document is every string reachable in its value
//! (or a single attribute when the search names one — the index stores the
//! whole text; attribute-scoped matching happens at predicate level).

use dashmap::DashMap;
use parking_lot::RwLock;

use tidemark_core::{IndexStats, TextIndex, Value};

/// Flattens every string in a value into one searchable text.
#[must_use]
pub fn doc_text(value: &Value) -> String {
    let mut out = String::new();
    collect_text(value, &mut out);
    out
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(s);
        }
        Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        Value::Map(fields) => {
            for field in fields.values() {
                collect_text(field, out);
            }
        }
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Bytes(_) => {}
    }
}

/// The per-map index registry.
#[derive(Default)]
pub struct SearchCatalog {
    indexes: DashMap<String, RwLock<TextIndex>>,
}

impl SearchCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one projection change: `None` removes the document,
    /// `Some` re-indexes it (remove-then-add).
    pub fn apply_change(&self, map_name: &str, key: &str, new_value: Option<&Value>) {
        let index = self
            .indexes
            .entry(map_name.to_string())
            .or_insert_with(|| RwLock::new(TextIndex::default()));
        let mut index = index.write();
        match new_value {
            Some(value) => index.index_document(key, &doc_text(value)),
            None => index.remove_document(key),
        }
    }

    /// Ranked search over one map's index, best first.
    #[must_use]
    pub fn search(&self, map_name: &str, query: &str) -> Vec<(String, f64)> {
        self.indexes
            .get(map_name)
            .map(|index| index.read().search(query))
            .unwrap_or_default()
    }

    /// BM25 score of one document against a query.
    #[must_use]
    pub fn score(&self, map_name: &str, query: &str, key: &str) -> f64 {
        self.indexes
            .get(map_name)
            .map(|index| {
                let index = index.read();
                index.score(&tidemark_core::tokenize(query), key)
            })
            .unwrap_or(0.0)
    }

    /// Index stats per map, for the debug surface.
    #[must_use]
    pub fn stats(&self) -> Vec<(String, IndexStats)> {
        let mut out: Vec<(String, IndexStats)> = self
            .indexes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().read().stats()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn doc(fields: &[(&str, &str)]) -> Value {
        Value::Map(
            fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), Value::from(*v)))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn doc_text_flattens_nested_strings() {
        let value = Value::Map(
            [
                ("title".to_string(), Value::from("quick brown")),
                (
                    "tags".to_string(),
                    Value::Array(vec![Value::from("fox"), Value::Int(7)]),
                ),
            ]
            .into_iter()
            .collect(),
        );
        let text = doc_text(&value);
        assert!(text.contains("quick brown"));
        assert!(text.contains("fox"));
    }

    #[test]
    fn catalog_indexes_and_searches() {
        let catalog = SearchCatalog::new();
        catalog.apply_change("posts", "p1", Some(&doc(&[("body", "rust sync engine")])));
        catalog.apply_change("posts", "p2", Some(&doc(&[("body", "cooking recipes")])));

        let hits = catalog.search("posts", "rust");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "p1");
        assert!(catalog.score("posts", "rust", "p1") > 0.0);
    }

    #[test]
    fn delete_removes_from_index() {
        let catalog = SearchCatalog::new();
        catalog.apply_change("posts", "p1", Some(&doc(&[("body", "rust")])));
        catalog.apply_change("posts", "p1", None);
        assert!(catalog.search("posts", "rust").is_empty());
    }

    #[test]
    fn update_reindexes() {
        let catalog = SearchCatalog::new();
        catalog.apply_change("posts", "p1", Some(&doc(&[("body", "old text")])));
        catalog.apply_change("posts", "p1", Some(&doc(&[("body", "new text")])));
        assert!(catalog.search("posts", "old").is_empty());
        assert_eq!(catalog.search("posts", "new").len(), 1);
    }

    #[test]
    fn unknown_map_searches_empty() {
        let catalog = SearchCatalog::new();
        assert!(catalog.search("nope", "anything").is_empty());
        assert_eq!(catalog.score("nope", "q", "k"), 0.0);
    }
}
