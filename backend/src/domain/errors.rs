//! Error types for the ledger domain.
//!
//! Storage and service boundaries return `anyhow::Result`; the enums here
//! classify the failures the accrual engine and ledger service need to tell
//! apart (skip-and-retry vs. data-integrity warning vs. caller mistake).

use rust_decimal::Decimal;
use shared::AllowancePeriod;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StoreError;

/// A stored recurring-event setting that cannot be evaluated
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("day {day} is out of range for a {} allowance", .period.as_str())]
    DayOutOfRange { period: AllowancePeriod, day: u32 },

    #[error("time of day '{0}' is not a valid HH:MM value")]
    InvalidTimeOfDay(String),

    #[error("allowance amount {0} is negative")]
    NegativeAmount(Decimal),

    #[error("weekly interest rate {0}% is negative")]
    NegativeInterestRate(Decimal),
}

/// Amount that cannot be represented in the ledger's currency precision
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MoneyError {
    #[error("amount {0} must be greater than zero")]
    NonPositive(Decimal),

    #[error("amount {0} has more than two decimal places")]
    TooPrecise(Decimal),

    #[error("amount {0} is too large")]
    Overflow(Decimal),

    #[error("interest on {balance} at {rate}% is out of range")]
    InterestOverflow { balance: Decimal, rate: Decimal },
}

/// Failure while evaluating or posting a recurring event for one child
#[derive(Debug, Error)]
pub enum AccrualError {
    #[error("ledger store error: {0}")]
    TransientStore(#[source] anyhow::Error),

    #[error("ledger store call '{operation}' timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("invalid recurring-event configuration: {0}")]
    InvalidScheduleConfig(#[from] ScheduleError),

    #[error("cannot compute interest: {0}")]
    InterestOutOfRange(#[from] MoneyError),

    #[error("child {child_id} not found in family {family_id}")]
    ChildNotFound { family_id: String, child_id: String },
}

impl AccrualError {
    /// Classify an error coming back from the ledger store
    pub fn from_store(error: anyhow::Error) -> Self {
        match error.downcast_ref::<StoreError>() {
            Some(StoreError::ChildNotFound {
                family_id,
                child_id,
            }) => AccrualError::ChildNotFound {
                family_id: family_id.clone(),
                child_id: child_id.clone(),
            },
            _ => AccrualError::TransientStore(error),
        }
    }
}

/// Failure of a user-initiated ledger operation
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidAmount(#[from] MoneyError),

    #[error("child {child_id} not found in family {family_id}")]
    ChildNotFound { family_id: String, child_id: String },

    #[error("ledger store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl LedgerError {
    pub fn from_store(error: anyhow::Error) -> Self {
        match error.downcast_ref::<StoreError>() {
            Some(StoreError::ChildNotFound {
                family_id,
                child_id,
            }) => LedgerError::ChildNotFound {
                family_id: family_id.clone(),
                child_id: child_id.clone(),
            },
            _ => LedgerError::Store(error),
        }
    }
}
