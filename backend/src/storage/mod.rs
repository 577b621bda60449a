//! # Storage Module
//!
//! Persistence for family ledgers.
//!
//! The domain layer only sees the [`LedgerStore`] and [`CacheInvalidator`]
//! traits. The SQLite backend keeps each child's balance and idempotency
//! markers on one row, so a marker-guarded append is a single conditional
//! UPDATE plus an INSERT inside one database transaction.
//!
//! ## Invariants
//!
//! - A balance changes only together with the transaction that explains it
//! - Engine postings are written only when the watched marker still holds
//!   the value the caller read
//! - Amounts are stored as integer cents

pub mod cache;
pub mod error;
pub mod sqlite;
pub mod traits;

#[cfg(test)]
pub mod test_utils;

pub use cache::{BroadcastCacheInvalidator, LedgerChanged, NoopCacheInvalidator};
pub use error::StoreError;
pub use sqlite::{DbConnection, SqliteLedgerStore};
pub use traits::{AppendOutcome, CacheInvalidator, LedgerStore};
