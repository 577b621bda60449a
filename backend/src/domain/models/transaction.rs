//! Domain model for ledger transactions and their provenance.
//!
//! Engine postings are recognised by an id prefix that only the constructors
//! in this module can produce, together with the explicit `source` tag.
//! Descriptions are never inspected.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{AllowancePeriod, TransactionSource, TransactionType};
use uuid::Uuid;

pub const ALLOWANCE_ID_PREFIX: &str = "allowance_";
pub const INTEREST_ID_PREFIX: &str = "interest_";
pub const MANUAL_ID_PREFIX: &str = "manual_";

/// The engine source reserved by an id prefix, if any
pub fn reserved_source_for_id(id: &str) -> Option<TransactionSource> {
    if id.starts_with(ALLOWANCE_ID_PREFIX) {
        Some(TransactionSource::Allowance)
    } else if id.starts_with(INTEREST_ID_PREFIX) {
        Some(TransactionSource::Interest)
    } else {
        None
    }
}

/// True when the id prefix and the source tag tell the same story
fn provenance_matches(id: &str, source: TransactionSource) -> bool {
    match source {
        TransactionSource::Manual => id.starts_with(MANUAL_ID_PREFIX),
        engine_source => reserved_source_for_id(id) == Some(engine_source),
    }
}

/// A transaction as stored in a child's ledger. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub family_id: String,
    pub child_id: String,
    pub transaction_type: TransactionType,
    /// Always positive
    pub amount: Decimal,
    /// Logical event time, used for idempotency windows
    pub timestamp: DateTime<Utc>,
    pub source: TransactionSource,
    pub description: String,
    /// Wall-clock insertion time
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    /// Amount as applied to the balance
    pub fn signed_amount(&self) -> Decimal {
        signed(self.transaction_type, self.amount)
    }

    /// Classify a historical posting as allowance or interest.
    ///
    /// Requires both the reserved id prefix and the matching source tag, so a
    /// manual transaction can never be mistaken for an engine posting.
    pub fn engine_source(&self) -> Option<TransactionSource> {
        match reserved_source_for_id(&self.id) {
            Some(source) if source == self.source => Some(source),
            _ => None,
        }
    }
}

/// A transaction about to be appended to a ledger.
///
/// Fields are private: the only way to obtain one is through the
/// constructors, which tie the id prefix to the source tag.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    id: String,
    transaction_type: TransactionType,
    amount: Decimal,
    timestamp: DateTime<Utc>,
    source: TransactionSource,
    description: String,
}

impl NewTransaction {
    /// Scheduled allowance deposit for the occurrence at `timestamp`
    pub fn allowance(amount: Decimal, timestamp: DateTime<Utc>, period: AllowancePeriod) -> Self {
        let description = match period {
            AllowancePeriod::Weekly => "Weekly allowance",
            AllowancePeriod::Monthly => "Monthly allowance",
        };
        Self {
            id: format!("{}{}", ALLOWANCE_ID_PREFIX, Uuid::new_v4().simple()),
            transaction_type: TransactionType::Deposit,
            amount,
            timestamp,
            source: TransactionSource::Allowance,
            description: description.to_string(),
        }
    }

    /// Daily interest deposit
    pub fn interest(amount: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}{}", INTEREST_ID_PREFIX, Uuid::new_v4().simple()),
            transaction_type: TransactionType::Deposit,
            amount,
            timestamp,
            source: TransactionSource::Interest,
            description: "Daily interest".to_string(),
        }
    }

    /// User-entered deposit or expense; the description is kept verbatim
    pub fn manual(
        transaction_type: TransactionType,
        amount: Decimal,
        timestamp: DateTime<Utc>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("{}{}", MANUAL_ID_PREFIX, Uuid::new_v4().simple()),
            transaction_type,
            amount,
            timestamp,
            source: TransactionSource::Manual,
            description: description.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> TransactionSource {
        self.source
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn signed_amount(&self) -> Decimal {
        signed(self.transaction_type, self.amount)
    }

    pub fn has_consistent_provenance(&self) -> bool {
        provenance_matches(&self.id, self.source)
    }
}

fn signed(transaction_type: TransactionType, amount: Decimal) -> Decimal {
    match transaction_type {
        TransactionType::Deposit => amount,
        TransactionType::Expense => -amount,
    }
}
