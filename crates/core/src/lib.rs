//! Tidemark core — CRDTs, hybrid logical clock, partitioning, predicates,
//! BM25 text index, and wire message schemas.
//!
//! This crate is the runtime-free foundation of the Tidemark sync engine:
//!
//! - **HLC** ([`hlc`]): hybrid logical clock and totally ordered timestamps
//! - **Records** ([`record`]): LWW, observed-remove, and PN counter records
//! - **Maps** ([`lww_map`], [`or_map`], [`pn_counter`]): the CRDT map kinds
//! - **Partitioning** ([`partition`], [`hash`]): key hashing and the
//!   versioned partition map
//! - **Queries** ([`predicate`], [`cursor`]): filter trees and pagination
//!   cursors
//! - **Search** ([`text`]): tokenizer, inverted index, BM25 scoring
//! - **Messages** ([`messages`]): the sealed wire envelope and payloads

pub mod cursor;
pub mod hash;
pub mod hlc;
pub mod lww_map;
pub mod messages;
pub mod or_map;
pub mod partition;
pub mod pn_counter;
pub mod predicate;
pub mod record;
pub mod text;
pub mod value;

pub use cursor::{Cursor, CursorError, SCORE_ATTRIBUTE};
pub use hash::{fnv1a_hash, key_hash};
pub use hlc::{ClockDriftError, ClockSource, HybridClock, SystemClock, Timestamp};
pub use lww_map::{LwwMap, MergeOutcome};
pub use messages::Message;
pub use or_map::{OrEntry, OrMap, OrMergeOutcome};
pub use partition::{key_to_partition, NodeInfo, PartitionMap, PartitionMapError, PARTITION_COUNT};
pub use pn_counter::PnCounterMap;
pub use predicate::{CompiledPredicate, Predicate, PredicateError, SortDirection, SortSpec};
pub use record::{LwwRecord, OrRecord, PnState, Record};
pub use text::{tokenize, Bm25Params, IndexStats, TextIndex};
pub use value::Value;
