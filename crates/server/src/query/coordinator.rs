//! Query coordination: local evaluation, remote merge, and the single final
//! sort+cursor+limit pass.
//!
//! Local evaluation is lazy: the result set reports its estimated size and
//! retrieval cost up front and materializes rows only when iterated. Remote
//! rows merge with local rows by key, the server value winning when its HLC
//! is newer. Sorting, cursor filtering, and the limit are applied exactly
//! once, on the merged and deduplicated set — never per source.

use std::sync::Arc;

use async_trait::async_trait;

use tidemark_core::cursor::{compare_rows, row_is_after_cursor, sort_vector, Cursor};
use tidemark_core::messages::{QueryRespPayload, QueryRow, QuerySpec, SearchOptions};
use tidemark_core::messages::{SearchHit, SearchRespPayload};
use tidemark_core::predicate::{CompiledPredicate, SortDirection, SortSpec};
use tidemark_core::{Timestamp, Value, SCORE_ATTRIBUTE};

use crate::error::EngineError;
use crate::query::index::SearchCatalog;
use crate::store::maps::MapStore;

/// Default page size when a query names none.
const DEFAULT_LIMIT: u32 = 100;

/// A remote row as returned by a partition owner.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    pub key: String,
    pub value: Value,
    /// HLC of the server's record, for authoritative-when-newer merging.
    pub hlc: Option<Timestamp>,
}

/// Fetches query rows from the partition owners; the network layer
/// implements this, tests stub it.
#[async_trait]
pub trait RemoteQuerier: Send + Sync {
    /// Runs the predicate on the owners of the map's partitions and returns
    /// every matching row (pre-limit).
    async fn query_owners(
        &self,
        map_name: &str,
        spec: &QuerySpec,
    ) -> anyhow::Result<Vec<RemoteRow>>;
}

/// A remote querier for single-node deployments: nothing to merge.
pub struct NoRemote;

#[async_trait]
impl RemoteQuerier for NoRemote {
    async fn query_owners(
        &self,
        _map_name: &str,
        _spec: &QuerySpec,
    ) -> anyhow::Result<Vec<RemoteRow>> {
        Ok(Vec::new())
    }
}

/// Lazily evaluated local result set.
pub struct LazyResultSet {
    rows: Vec<(String, Value)>,
    predicate: Option<CompiledPredicate>,
}

impl LazyResultSet {
    /// Rows in the snapshot before predicate filtering; the upper bound the
    /// planner reports.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        self.rows.len()
    }

    /// Cost proxy: rows that must be visited to materialize.
    #[must_use]
    pub fn retrieval_cost(&self) -> usize {
        self.rows.len()
    }

    /// Materializes the matching rows. Deferred until this call.
    #[must_use]
    pub fn to_rows(&self) -> Vec<(String, Value)> {
        self.rows
            .iter()
            .filter(|(_, value)| {
                self.predicate
                    .as_ref()
                    .is_none_or(|p| p.matches(value))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// The query coordinator.
pub struct QueryCoordinator {
    store: Arc<MapStore>,
    catalog: Arc<SearchCatalog>,
    remote: Arc<dyn RemoteQuerier>,
}

impl QueryCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<MapStore>,
        catalog: Arc<SearchCatalog>,
        remote: Arc<dyn RemoteQuerier>,
    ) -> Self {
        Self {
            store,
            catalog,
            remote,
        }
    }

    /// Plans the local half of a query without materializing it.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] when the predicate fails to compile.
    pub fn plan_local(&self, map_name: &str, spec: &QuerySpec) -> Result<LazyResultSet, EngineError> {
        let predicate = spec
            .predicate
            .as_ref()
            .map(tidemark_core::Predicate::compile)
            .transpose()
            .map_err(|e| EngineError::Schema(e.to_string()))?;
        Ok(LazyResultSet {
            rows: self.store.snapshot(map_name),
            predicate,
        })
    }

    /// Executes a query: local predicate pass, remote fan-out, merge by key
    /// (server wins when newer), then one sort+cursor+limit pass.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on an uncompilable predicate or malformed
    /// cursor; [`EngineError::Transport`] when the remote fan-out fails.
    pub async fn execute(
        &self,
        request_id: &str,
        map_name: &str,
        spec: &QuerySpec,
    ) -> Result<QueryRespPayload, EngineError> {
        let local = self.plan_local(map_name, spec)?;
        let remote_rows = self
            .remote
            .query_owners(map_name, spec)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        // Merge by key; the server's value is authoritative when its HLC is
        // newer than the local record's.
        let mut merged: ahash::AHashMap<String, Value> = local.to_rows().into_iter().collect();
        for remote in remote_rows {
            let take_remote = match (&remote.hlc, self.store.lww_timestamp(map_name, &remote.key))
            {
                (Some(remote_hlc), Some(local_hlc)) => *remote_hlc > local_hlc,
                _ => true,
            };
            if take_remote {
                merged.insert(remote.key, remote.value);
            }
        }

        let page = paginate(
            merged.into_iter().collect(),
            &spec.sort,
            spec.cursor.as_deref(),
            spec.limit.unwrap_or(DEFAULT_LIMIT) as usize,
            |_key| None,
        )?;

        metrics::histogram!("query_rows").record(page.rows.len() as f64);
        Ok(QueryRespPayload {
            request_id: request_id.to_string(),
            results: page
                .rows
                .into_iter()
                .map(|(key, value)| QueryRow { key, value })
                .collect(),
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }

    /// Executes a full-text search: BM25 candidates, `_score` sorting
    /// (descending by default), cursor pagination.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on a malformed cursor.
    pub fn search(
        &self,
        request_id: &str,
        map_name: &str,
        options: &SearchOptions,
    ) -> Result<SearchRespPayload, EngineError> {
        let scored = self.catalog.search(map_name, &options.query);
        let rows: Vec<(String, Value)> = scored
            .iter()
            .filter_map(|(key, _)| {
                self.store.get(map_name, key).map(|value| (key.clone(), value))
            })
            .collect();
        let scores: ahash::AHashMap<String, f64> = scored.into_iter().collect();

        let sort = vec![SortSpec {
            attribute: SCORE_ATTRIBUTE.to_string(),
            direction: SortDirection::Desc,
        }];
        let page = paginate(
            rows,
            &sort,
            options.cursor.as_deref(),
            options.limit.unwrap_or(DEFAULT_LIMIT) as usize,
            |key| scores.get(key).copied(),
        )?;

        Ok(SearchRespPayload {
            request_id: request_id.to_string(),
            results: page
                .rows
                .into_iter()
                .map(|(key, value)| {
                    let score = scores.get(&key).copied().unwrap_or(0.0);
                    SearchHit { key, value, score }
                })
                .collect(),
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }
}

struct Page {
    rows: Vec<(String, Value)>,
    next_cursor: Option<String>,
    has_more: bool,
}

/// The single sort+cursor+limit pass over a merged, deduplicated row set.
fn paginate(
    rows: Vec<(String, Value)>,
    sort: &[SortSpec],
    cursor: Option<&str>,
    limit: usize,
    score_of: impl Fn(&str) -> Option<f64>,
) -> Result<Page, EngineError> {
    let cursor = cursor
        .map(Cursor::decode)
        .transpose()
        .map_err(|e| EngineError::Schema(e.to_string()))?;

    let mut keyed: Vec<(Vec<Value>, String, Value)> = rows
        .into_iter()
        .map(|(key, value)| {
            let keys = sort_vector(&value, score_of(&key), sort);
            (keys, key, value)
        })
        .collect();
    keyed.sort_by(|a, b| compare_rows((&a.0, &a.1), (&b.0, &b.1), sort));

    let after_cursor: Vec<(Vec<Value>, String, Value)> = match &cursor {
        Some(cursor) => keyed
            .into_iter()
            .filter(|(keys, key, _)| row_is_after_cursor(cursor, keys, key, sort))
            .collect(),
        None => keyed,
    };

    let has_more = after_cursor.len() > limit;
    let mut page: Vec<(Vec<Value>, String, Value)> = after_cursor;
    page.truncate(limit);

    let next_cursor = if has_more {
        page.last().map(|(keys, key, _)| {
            Cursor {
                sort_keys: keys.clone(),
                primary_key: key.clone(),
            }
            .encode()
        })
    } else {
        None
    };

    Ok(Page {
        rows: page.into_iter().map(|(_, key, value)| (key, value)).collect(),
        next_cursor,
        has_more,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tidemark_core::Predicate;

    use super::*;

    fn doc(score: i64, name: &str) -> Value {
        Value::Map(
            [
                ("score".to_string(), Value::Int(score)),
                ("name".to_string(), Value::from(name)),
            ]
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
        )
    }

    fn coordinator_with_items(items: &[(String, Value)]) -> QueryCoordinator {
        let store = Arc::new(MapStore::new("n1"));
        for (key, value) in items {
            store.lww_set("items", key, value.clone(), None).unwrap();
        }
        QueryCoordinator::new(store, Arc::new(SearchCatalog::new()), Arc::new(NoRemote))
    }

    fn seeded() -> QueryCoordinator {
        let items: Vec<(String, Value)> = (0..10)
            .map(|i| (format!("item/{i}"), doc(i, &format!("thing {i}"))))
            .collect();
        coordinator_with_items(&items)
    }

    fn sort_asc() -> Vec<SortSpec> {
        vec![SortSpec {
            attribute: "score".into(),
            direction: SortDirection::Asc,
        }]
    }

    #[tokio::test]
    async fn cursor_pagination_walks_pages_in_order() {
        let coordinator = seeded();
        let spec = QuerySpec {
            predicate: None,
            sort: sort_asc(),
            limit: Some(3),
            cursor: None,
        };
        let page1 = coordinator.execute("q1", "items", &spec).await.unwrap();
        let keys: Vec<&str> = page1.results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["item/0", "item/1", "item/2"]);
        assert!(page1.has_more);
        let cursor = page1.next_cursor.expect("cursor for next page");

        let spec2 = QuerySpec {
            cursor: Some(cursor),
            ..spec
        };
        let page2 = coordinator.execute("q2", "items", &spec2).await.unwrap();
        let keys: Vec<&str> = page2.results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["item/3", "item/4", "item/5"]);
        assert!(page2.has_more);
    }

    #[tokio::test]
    async fn cursor_is_stable_under_inserts_before_it() {
        let coordinator = seeded();
        let spec = QuerySpec {
            predicate: None,
            sort: sort_asc(),
            limit: Some(3),
            cursor: None,
        };
        let page1 = coordinator.execute("q1", "items", &spec).await.unwrap();
        let cursor = page1.next_cursor.unwrap();

        // Insert a row sorting before the cursor; page 2 is unaffected.
        coordinator
            .store
            .lww_set("items", "item/new", doc(-1, "early"), None)
            .unwrap();

        let page2 = coordinator
            .execute(
                "q2",
                "items",
                &QuerySpec {
                    cursor: Some(cursor),
                    ..spec
                },
            )
            .await
            .unwrap();
        let keys: Vec<&str> = page2.results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["item/3", "item/4", "item/5"]);
    }

    #[tokio::test]
    async fn duplicate_sort_keys_tiebreak_by_primary_key() {
        let items: Vec<(String, Value)> = (0..4)
            .map(|i| (format!("item/{i}"), doc(7, "same")))
            .collect();
        let coordinator = coordinator_with_items(&items);
        let spec = QuerySpec {
            predicate: None,
            sort: sort_asc(),
            limit: Some(2),
            cursor: None,
        };
        let page1 = coordinator.execute("q", "items", &spec).await.unwrap();
        let keys1: Vec<&str> = page1.results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys1, vec!["item/0", "item/1"]);

        let page2 = coordinator
            .execute(
                "q",
                "items",
                &QuerySpec {
                    cursor: page1.next_cursor,
                    ..spec
                },
            )
            .await
            .unwrap();
        let keys2: Vec<&str> = page2.results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys2, vec!["item/2", "item/3"]);
        assert!(!page2.has_more);
    }

    #[tokio::test]
    async fn predicate_filters_before_pagination() {
        let coordinator = seeded();
        let spec = QuerySpec {
            predicate: Some(Predicate::Gte {
                attribute: "score".into(),
                value: Value::Int(8),
            }),
            sort: sort_asc(),
            limit: Some(10),
            cursor: None,
        };
        let page = coordinator.execute("q", "items", &spec).await.unwrap();
        let keys: Vec<&str> = page.results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["item/8", "item/9"]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn lazy_result_set_defers_materialization() {
        let coordinator = seeded();
        let lazy = coordinator
            .plan_local(
                "items",
                &QuerySpec {
                    predicate: Some(Predicate::Lt {
                        attribute: "score".into(),
                        value: Value::Int(3),
                    }),
                    ..QuerySpec::default()
                },
            )
            .unwrap();
        assert_eq!(lazy.estimated_size(), 10);
        assert_eq!(lazy.retrieval_cost(), 10);
        assert_eq!(lazy.to_rows().len(), 3);
    }

    struct FixedRemote(Vec<RemoteRow>);

    #[async_trait]
    impl RemoteQuerier for FixedRemote {
        async fn query_owners(
            &self,
            _map_name: &str,
            _spec: &QuerySpec,
        ) -> anyhow::Result<Vec<RemoteRow>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn remote_rows_merge_with_server_authoritative_when_newer() {
        let store = Arc::new(MapStore::new("n1"));
        store.lww_set("items", "shared", doc(1, "local"), None).unwrap();
        let local_hlc = store.lww_timestamp("items", "shared").unwrap();

        let newer = Timestamp {
            millis: local_hlc.millis + 10_000,
            counter: 0,
            node_id: "server".into(),
        };
        let older = Timestamp {
            millis: local_hlc.millis.saturating_sub(10_000),
            counter: 0,
            node_id: "server".into(),
        };
        let remote = FixedRemote(vec![
            RemoteRow {
                key: "shared".into(),
                value: doc(1, "server-newer"),
                hlc: Some(newer),
            },
            RemoteRow {
                key: "remote-only".into(),
                value: doc(2, "remote"),
                hlc: Some(older.clone()),
            },
        ]);
        let coordinator = QueryCoordinator::new(
            store,
            Arc::new(SearchCatalog::new()),
            Arc::new(remote),
        );

        let page = coordinator
            .execute(
                "q",
                "items",
                &QuerySpec {
                    sort: sort_asc(),
                    ..QuerySpec::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.results.len(), 2);
        let shared = page.results.iter().find(|r| r.key == "shared").unwrap();
        assert_eq!(shared.value.attribute("name"), Some(&Value::from("server-newer")));
    }

    #[tokio::test]
    async fn stale_remote_row_loses_to_local() {
        let store = Arc::new(MapStore::new("n1"));
        store.lww_set("items", "shared", doc(1, "local"), None).unwrap();
        let local_hlc = store.lww_timestamp("items", "shared").unwrap();

        let remote = FixedRemote(vec![RemoteRow {
            key: "shared".into(),
            value: doc(1, "stale-server"),
            hlc: Some(Timestamp {
                millis: local_hlc.millis.saturating_sub(5_000),
                counter: 0,
                node_id: "server".into(),
            }),
        }]);
        let coordinator = QueryCoordinator::new(
            store,
            Arc::new(SearchCatalog::new()),
            Arc::new(remote),
        );
        let page = coordinator
            .execute("q", "items", &QuerySpec::default())
            .await
            .unwrap();
        assert_eq!(
            page.results[0].value.attribute("name"),
            Some(&Value::from("local"))
        );
    }

    #[tokio::test]
    async fn search_ranks_by_score_with_cursor() {
        let store = Arc::new(MapStore::new("n1"));
        let catalog = Arc::new(SearchCatalog::new());
        for (key, text) in [
            ("d1", "rust rust rust"),
            ("d2", "rust systems"),
            ("d3", "rust"),
            ("d4", "unrelated"),
        ] {
            let value = doc(0, text);
            store.lww_set("docs", key, value.clone(), None).unwrap();
            catalog.apply_change("docs", key, Some(&value));
        }
        let coordinator = QueryCoordinator::new(store, catalog, Arc::new(NoRemote));

        let page1 = coordinator
            .search(
                "s1",
                "docs",
                &SearchOptions {
                    query: "rust".into(),
                    attribute: None,
                    limit: Some(2),
                    cursor: None,
                },
            )
            .unwrap();
        assert_eq!(page1.results.len(), 2);
        assert!(page1.has_more);
        assert!(page1.results[0].score >= page1.results[1].score);

        let page2 = coordinator
            .search(
                "s2",
                "docs",
                &SearchOptions {
                    query: "rust".into(),
                    attribute: None,
                    limit: Some(2),
                    cursor: page1.next_cursor,
                },
            )
            .unwrap();
        assert_eq!(page2.results.len(), 1);
        assert!(!page2.has_more);

        // No page overlaps.
        let all: Vec<&str> = page1
            .results
            .iter()
            .chain(page2.results.iter())
            .map(|h| h.key.as_str())
            .collect();
        let mut dedup = all.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), all.len());
    }
}
