use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a stored or transmitted enum value is not recognised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} value: '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// Direction of a ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Money added to the child's balance
    Deposit,
    /// Money taken out of the child's balance
    Expense,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Expense => "expense",
        }
    }
}

impl FromStr for TransactionType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "expense" => Ok(TransactionType::Expense),
            other => Err(ParseEnumError {
                kind: "transaction type",
                value: other.to_string(),
            }),
        }
    }
}

/// Which subsystem created a transaction.
///
/// This is the only field consulted when classifying postings; descriptions
/// are free text and carry no meaning for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionSource {
    /// Entered by a parent or child through the app
    Manual,
    /// Posted by the accrual engine for a scheduled allowance
    Allowance,
    /// Posted by the accrual engine for daily interest
    Interest,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSource::Manual => "manual",
            TransactionSource::Allowance => "allowance",
            TransactionSource::Interest => "interest",
        }
    }
}

impl FromStr for TransactionSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TransactionSource::Manual),
            "allowance" => Ok(TransactionSource::Allowance),
            "interest" => Ok(TransactionSource::Interest),
            other => Err(ParseEnumError {
                kind: "transaction source",
                value: other.to_string(),
            }),
        }
    }
}

/// How often an allowance is paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowancePeriod {
    Weekly,
    Monthly,
}

impl AllowancePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllowancePeriod::Weekly => "weekly",
            AllowancePeriod::Monthly => "monthly",
        }
    }
}

impl FromStr for AllowancePeriod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(AllowancePeriod::Weekly),
            "monthly" => Ok(AllowancePeriod::Monthly),
            other => Err(ParseEnumError {
                kind: "allowance period",
                value: other.to_string(),
            }),
        }
    }
}

/// The two recurring events handled by the accrual engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccrualEvent {
    Allowance,
    Interest,
}

impl AccrualEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccrualEvent::Allowance => "allowance",
            AccrualEvent::Interest => "interest",
        }
    }

    /// Source kind stamped on transactions posted for this event
    pub fn source(&self) -> TransactionSource {
        match self {
            AccrualEvent::Allowance => TransactionSource::Allowance,
            AccrualEvent::Interest => TransactionSource::Interest,
        }
    }
}

impl fmt::Display for AccrualEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact, serializable outcome of one accrual tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    /// Tick instant (RFC 3339)
    pub tick_at: String,
    pub families_processed: u32,
    pub families_failed: u32,
    pub children_processed: u32,
    pub allowances_posted: u32,
    pub interest_posted: u32,
    pub markers_advanced: u32,
    pub conflicts: u32,
    pub invalid_configs: u32,
    pub failures: u32,
    /// Sum of all amounts posted during the tick
    pub total_posted: Decimal,
    /// True when the family enumeration itself failed
    pub listing_failed: bool,
}
