//! Query pipeline: coordination, full-text indexing, and live
//! subscriptions.

pub mod coordinator;
pub mod index;
pub mod live;

pub use coordinator::{LazyResultSet, NoRemote, QueryCoordinator, RemoteQuerier, RemoteRow};
pub use index::{doc_text, SearchCatalog};
pub use live::{SubscriptionKey, SubscriptionManager};
