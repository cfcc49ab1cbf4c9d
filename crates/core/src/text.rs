//! Tokenizer, inverted index, and BM25 ranking for full-text search.
//!
//! The index maps terms to postings (document id, term frequency, token
//! positions) and tracks per-document lengths plus the corpus average. IDF
//! values are cached per term and the cache is invalidated by any add or
//! remove. Document updates are remove-then-add.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    /// Term-frequency saturation. Default 1.2.
    pub k1: f64,
    /// Length normalization strength. Default 0.75.
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Lowercases and splits on non-alphanumeric boundaries, dropping empties.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// A term's occurrences within one document.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Posting {
    /// Number of occurrences.
    tf: u32,
    /// Zero-based token positions, ascending.
    positions: Vec<u32>,
}

/// Summary counters for the debug surface.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub doc_count: usize,
    pub term_count: usize,
    pub avg_doc_len: f64,
}

/// Tokenized inverted index with BM25 scoring.
pub struct TextIndex {
    params: Bm25Params,
    /// term -> doc id -> posting.
    postings: HashMap<String, HashMap<String, Posting>>,
    /// doc id -> token count.
    doc_len: HashMap<String, u32>,
    /// Sum of all document lengths, for the avgdl denominator.
    total_len: u64,
    /// Per-term IDF cache, cleared by any mutation.
    idf_cache: Mutex<HashMap<String, f64>>,
}

impl Default for TextIndex {
    fn default() -> Self {
        Self::new(Bm25Params::default())
    }
}

impl TextIndex {
    /// Creates an empty index with the given BM25 parameters.
    #[must_use]
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            postings: HashMap::new(),
            doc_len: HashMap::new(),
            total_len: 0,
            idf_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Indexes (or re-indexes) a document. Existing postings for the id are
    /// removed first.
    pub fn index_document(&mut self, doc_id: &str, text: &str) {
        self.remove_document(doc_id);

        let tokens = tokenize(text);
        if tokens.is_empty() {
            return;
        }
        #[allow(clippy::cast_possible_truncation)]
        for (position, term) in tokens.iter().enumerate() {
            let posting = self
                .postings
                .entry(term.clone())
                .or_default()
                .entry(doc_id.to_string())
                .or_insert(Posting {
                    tf: 0,
                    positions: Vec::new(),
                });
            posting.tf += 1;
            posting.positions.push(position as u32);
        }
        #[allow(clippy::cast_possible_truncation)]
        let len = tokens.len() as u32;
        self.doc_len.insert(doc_id.to_string(), len);
        self.total_len += u64::from(len);
        self.invalidate_idf();
    }

    /// Removes a document from the index. Unknown ids are a no-op.
    pub fn remove_document(&mut self, doc_id: &str) {
        let Some(len) = self.doc_len.remove(doc_id) else {
            return;
        };
        self.total_len -= u64::from(len);
        self.postings.retain(|_, docs| {
            docs.remove(doc_id);
            !docs.is_empty()
        });
        self.invalidate_idf();
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn doc_count(&self) -> usize {
        self.doc_len.len()
    }

    /// Whether a document is indexed.
    #[must_use]
    pub fn contains(&self, doc_id: &str) -> bool {
        self.doc_len.contains_key(doc_id)
    }

    /// Average document length; zero for an empty corpus.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_doc_len(&self) -> f64 {
        if self.doc_len.is_empty() {
            0.0
        } else {
            self.total_len as f64 / self.doc_len.len() as f64
        }
    }

    /// Counter snapshot for the debug surface.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            doc_count: self.doc_count(),
            term_count: self.postings.len(),
            avg_doc_len: self.avg_doc_len(),
        }
    }

    /// Inverse document frequency of a term, cached until the next mutation.
    ///
    /// `ln(((N - df + 0.5) / (df + 0.5)) + 1)` — always positive, saturating
    /// toward zero for terms present in every document.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn idf(&self, term: &str) -> f64 {
        let mut cache = self
            .idf_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(term) {
            return *cached;
        }
        let n = self.doc_len.len() as f64;
        let df = self.postings.get(term).map_or(0, HashMap::len) as f64;
        let idf = (((n - df + 0.5) / (df + 0.5)) + 1.0).ln();
        cache.insert(term.to_string(), idf);
        idf
    }

    /// BM25 score of a document against a set of query terms.
    ///
    /// Zero when the document is unknown or shares no terms with the query.
    #[must_use]
    pub fn score(&self, terms: &[String], doc_id: &str) -> f64 {
        let Some(doc_len) = self.doc_len.get(doc_id) else {
            return 0.0;
        };
        let avgdl = self.avg_doc_len();
        let Bm25Params { k1, b } = self.params;
        let mut score = 0.0;
        for term in terms {
            let Some(posting) = self.postings.get(term).and_then(|d| d.get(doc_id)) else {
                continue;
            };
            let tf = f64::from(posting.tf);
            let norm = if avgdl > 0.0 {
                1.0 - b + b * f64::from(*doc_len) / avgdl
            } else {
                1.0
            };
            score += self.idf(term) * (tf * (k1 + 1.0)) / (tf + k1 * norm);
        }
        score
    }

    /// Ranks all documents matching any term of the query, best first.
    ///
    /// Ties in score order by document id so pagination is stable.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<(String, f64)> {
        let terms = tokenize(query);
        let mut candidates: Vec<String> = Vec::new();
        for term in &terms {
            if let Some(docs) = self.postings.get(term) {
                candidates.extend(docs.keys().cloned());
            }
        }
        candidates.sort_unstable();
        candidates.dedup();

        let mut scored: Vec<(String, f64)> = candidates
            .into_iter()
            .map(|doc_id| {
                let score = self.score(&terms, &doc_id);
                (doc_id, score)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }

    /// Whether a document contains the query terms as a consecutive phrase.
    #[must_use]
    pub fn matches_phrase(&self, doc_id: &str, query: &str) -> bool {
        let terms = tokenize(query);
        if terms.is_empty() {
            return false;
        }
        // Positions of the first term anchor the phrase walk.
        let Some(first) = self
            .postings
            .get(&terms[0])
            .and_then(|docs| docs.get(doc_id))
        else {
            return false;
        };
        first.positions.iter().any(|&start| {
            terms.iter().enumerate().skip(1).all(|(offset, term)| {
                #[allow(clippy::cast_possible_truncation)]
                let wanted = start + offset as u32;
                self.postings
                    .get(term)
                    .and_then(|docs| docs.get(doc_id))
                    .is_some_and(|p| p.positions.binary_search(&wanted).is_ok())
            })
        })
    }

    /// Documents containing any term starting with `prefix`.
    #[must_use]
    pub fn docs_with_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_lowercase();
        let mut out: Vec<String> = self
            .postings
            .iter()
            .filter(|(term, _)| term.starts_with(&prefix))
            .flat_map(|(_, docs)| docs.keys().cloned())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    fn invalidate_idf(&mut self) {
        self.idf_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
