//! tokenwatch-data crate
//!
//! Chain access, adaptive range fetching, SQLite storage and batched
//! persistence of ERC-20 transfer events.

pub mod export;
pub mod fetcher;
pub mod persister;
pub mod source;
pub mod store;
pub mod types;

pub use fetcher::{FetchError, RangeFetcher, RetryPolicy};
pub use persister::{EventPersister, PersistReport};
pub use source::{LogSource, RpcLogSource, SourceError};
pub use store::Store;
pub use types::{NewTransaction, ScoreUpdate, Transaction, TransferEvent, WindowMetrics};
