//! Infrastructure layer: document store contract, distributed lock,
//! write-only transaction and the periodic server components built on them.

pub mod components;
pub mod config;
pub mod lock;
pub mod queue;
pub mod storage;
pub mod store;
pub mod transaction;


#[cfg(test)]
mod testing;

pub use config::{ConfigError, StorageOptions};
pub use storage::JobStorage;
pub use transaction::{CommitOutcome, TransactionError, WriteOnlyTransaction};
