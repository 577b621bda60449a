//! # Storage Traits
//!
//! Abstractions the accrual engine and ledger service depend on. Any backend
//! that can perform the marker-guarded append atomically can be plugged in.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::models::{ChildLedger, LedgerTransaction, MarkerField, NewTransaction};

/// Result of a marker-guarded append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Marker matched: marker, balance and transaction were written together
    Applied,
    /// Marker had already moved; nothing was written
    Conflict,
}

/// Ledger document storage
///
/// Balances move only through the two append operations, always by exactly
/// the signed amount of the appended transaction.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// All family identifiers known to the store
    async fn list_families(&self) -> Result<Vec<String>>;

    /// Active (non-archived) children of a family
    async fn list_children(&self, family_id: &str) -> Result<Vec<ChildLedger>>;

    /// Fresh snapshot of one child, `None` if it does not exist
    async fn get_child(&self, family_id: &str, child_id: &str) -> Result<Option<ChildLedger>>;

    /// Atomically compare `marker` against `expected_old_marker` and, if equal,
    /// set it to `new_marker`, append `transaction` (if any) and adjust the
    /// balance by its signed amount.
    ///
    /// `None` as the expected value means "the marker must still be unset".
    async fn append_transaction_if_marker_unchanged(
        &self,
        family_id: &str,
        child_id: &str,
        transaction: Option<&NewTransaction>,
        marker: MarkerField,
        expected_old_marker: Option<DateTime<Utc>>,
        new_marker: DateTime<Utc>,
    ) -> Result<AppendOutcome>;

    /// Unconditional append with a relative balance adjustment, for manual entries
    async fn append_transaction(&self, family_id: &str, child_id: &str, transaction: &NewTransaction) -> Result<()>;

    /// Transactions newest first
    async fn list_transactions(
        &self,
        family_id: &str,
        child_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<LedgerTransaction>>;
}

/// Hook for telling read caches that a child's ledger changed
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, family_id: &str, child_id: &str) -> Result<()>;
}
