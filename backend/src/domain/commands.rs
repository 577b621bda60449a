//! Domain-level command and query types.
//!
//! Used by services inside the domain layer; an API layer maps its own
//! request DTOs onto these.

pub mod transactions {
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use shared::TransactionType;

    /// Input for a user-entered deposit or expense.
    #[derive(Debug, Clone)]
    pub struct PostManualTransactionCommand {
        pub family_id: String,
        pub child_id: String,
        pub transaction_type: TransactionType,
        /// Positive; the direction comes from `transaction_type`
        pub amount: Decimal,
        pub description: String,
        /// Logical date of the transaction, defaults to now
        pub date: Option<DateTime<Utc>>,
    }

    /// Result of posting a manual transaction.
    #[derive(Debug, Clone)]
    pub struct PostManualTransactionResult {
        pub transaction_id: String,
        pub transaction_type: TransactionType,
        pub amount: Decimal,
        /// Balance read back after the append
        pub balance: Decimal,
    }

    /// Query parameters for listing transactions.
    #[derive(Debug, Clone)]
    pub struct TransactionListQuery {
        pub family_id: String,
        pub child_id: String,
        pub limit: Option<u32>,
    }

    /// Stored balance compared with a full replay of the ledger.
    #[derive(Debug, Clone, PartialEq)]
    pub struct BalanceAudit {
        pub stored_balance: Decimal,
        pub replayed_balance: Decimal,
        pub transaction_count: usize,
    }

    impl BalanceAudit {
        pub fn is_consistent(&self) -> bool {
            self.stored_balance == self.replayed_balance
        }
    }
}
