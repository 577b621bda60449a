//! Manual ledger operations.
//!
//! The user-facing write path that shares each ledger with the accrual
//! engine. Manual postings never touch the idempotency markers and always
//! adjust the balance relatively, so they compose with engine postings in
//! any interleaving.

use chrono::Utc;
use rust_decimal::Decimal;
use shared::TransactionSource;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::commands::transactions::{
    BalanceAudit, PostManualTransactionCommand, PostManualTransactionResult, TransactionListQuery,
};
use crate::domain::errors::LedgerError;
use crate::domain::models::{LedgerTransaction, NewTransaction};
use crate::domain::money::validate_posting_amount;
use crate::storage::{CacheInvalidator, LedgerStore};

/// Largest amount accepted for a single manual posting
pub const MAX_MANUAL_AMOUNT: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// Longest accepted description, in characters
pub const MAX_DESCRIPTION_LENGTH: usize = 256;

#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn CacheInvalidator>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self { store, cache }
    }

    /// Validate and append a user-entered deposit or expense
    pub async fn post_manual_transaction(
        &self,
        command: PostManualTransactionCommand,
    ) -> Result<PostManualTransactionResult, LedgerError> {
        info!(
            family_id = %command.family_id,
            child_id = %command.child_id,
            transaction_type = command.transaction_type.as_str(),
            amount = %command.amount,
            "Posting manual transaction"
        );

        validate_posting_amount(command.amount)?;
        if command.amount > MAX_MANUAL_AMOUNT {
            return Err(LedgerError::Validation(format!(
                "amount {} exceeds the maximum of {}",
                command.amount, MAX_MANUAL_AMOUNT
            )));
        }

        let description = command.description.trim();
        if description.is_empty() {
            return Err(LedgerError::Validation("description cannot be empty".to_string()));
        }
        if description.chars().count() > MAX_DESCRIPTION_LENGTH {
            return Err(LedgerError::Validation(format!(
                "description cannot exceed {} characters",
                MAX_DESCRIPTION_LENGTH
            )));
        }

        let transaction = NewTransaction::manual(
            command.transaction_type,
            command.amount,
            command.date.unwrap_or_else(Utc::now),
            description,
        );

        self.store
            .append_transaction(&command.family_id, &command.child_id, &transaction)
            .await
            .map_err(LedgerError::from_store)?;

        if let Err(cause) = self.cache.invalidate(&command.family_id, &command.child_id).await {
            warn!(
                family_id = %command.family_id,
                child_id = %command.child_id,
                cause = %cause,
                "Cache invalidation failed"
            );
        }

        let balance = self
            .store
            .get_child(&command.family_id, &command.child_id)
            .await
            .map_err(LedgerError::from_store)?
            .map(|child| child.balance)
            .ok_or_else(|| LedgerError::ChildNotFound {
                family_id: command.family_id.clone(),
                child_id: command.child_id.clone(),
            })?;

        info!(transaction_id = transaction.id(), balance = %balance, "Manual transaction posted");

        Ok(PostManualTransactionResult {
            transaction_id: transaction.id().to_string(),
            transaction_type: transaction.transaction_type(),
            amount: transaction.amount(),
            balance,
        })
    }

    /// Transactions newest first
    pub async fn list_transactions(&self, query: TransactionListQuery) -> Result<Vec<LedgerTransaction>, LedgerError> {
        self.store
            .list_transactions(&query.family_id, &query.child_id, query.limit)
            .await
            .map_err(LedgerError::from_store)
    }

    /// Replay the whole ledger and compare with the stored balance.
    ///
    /// Diagnostic only; nothing on the posting path depends on it.
    pub async fn audit_balance(&self, family_id: &str, child_id: &str) -> Result<BalanceAudit, LedgerError> {
        let child = self
            .store
            .get_child(family_id, child_id)
            .await
            .map_err(LedgerError::from_store)?
            .ok_or_else(|| LedgerError::ChildNotFound {
                family_id: family_id.to_string(),
                child_id: child_id.to_string(),
            })?;

        let transactions = self
            .store
            .list_transactions(family_id, child_id, None)
            .await
            .map_err(LedgerError::from_store)?;

        let audit = BalanceAudit {
            stored_balance: child.balance,
            replayed_balance: transactions.iter().map(LedgerTransaction::signed_amount).sum(),
            transaction_count: transactions.len(),
        };
        if !audit.is_consistent() {
            warn!(
                family_id,
                child_id,
                stored = %audit.stored_balance,
                replayed = %audit.replayed_balance,
                "Stored balance does not match ledger replay"
            );
        }
        Ok(audit)
    }

    /// Which engine event produced a transaction, if any
    pub fn classify_posting(transaction: &LedgerTransaction) -> Option<TransactionSource> {
        transaction.engine_source()
    }
}
