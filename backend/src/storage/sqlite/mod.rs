//! SQLite implementation of the ledger store.

pub mod connection;
pub mod ledger_repository;

pub use connection::DbConnection;
pub use ledger_repository::SqliteLedgerStore;
