//! Local state: the named-map registry and the pending-op journal.

pub mod maps;
pub mod oplog;

pub use maps::{ChangeEvent, ChangeKind, MapEvent, MapKind, MapStore};
pub use oplog::Oplog;
