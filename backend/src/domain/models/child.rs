//! Domain model for a child's ledger document and its recurring-event settings.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{AccrualEvent, AllowancePeriod};
use uuid::Uuid;

use crate::domain::errors::ScheduleError;

/// A family groups the children whose ledgers are processed together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Family {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Family {
    pub fn generate_id() -> String {
        format!("family::{}", Uuid::new_v4().simple())
    }
}

/// Recurring allowance settings, edited only through the configuration flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowanceConfig {
    pub amount: Decimal,
    pub period: AllowancePeriod,
    /// Weekly: 0 = Sunday, 1 = Monday, ..., 6 = Saturday. Monthly: 1..=31
    pub day_of_period: u32,
    /// Local wall-clock time, "HH:MM"
    pub time_of_day: String,
    pub is_active: bool,
}

impl AllowanceConfig {
    pub fn is_valid_day_of_week(day: u32) -> bool {
        day <= 6
    }

    pub fn is_valid_day_of_month(day: u32) -> bool {
        (1..=31).contains(&day)
    }
}

/// Which idempotency marker a conditional ledger write watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerField {
    LastAllowancePayment,
    LastInterestCalculation,
}

impl MarkerField {
    pub fn for_event(event: AccrualEvent) -> Self {
        match event {
            AccrualEvent::Allowance => MarkerField::LastAllowancePayment,
            AccrualEvent::Interest => MarkerField::LastInterestCalculation,
        }
    }

    pub fn event(&self) -> AccrualEvent {
        match self {
            MarkerField::LastAllowancePayment => AccrualEvent::Allowance,
            MarkerField::LastInterestCalculation => AccrualEvent::Interest,
        }
    }

    /// Column holding this marker in the children table
    pub fn column(&self) -> &'static str {
        match self {
            MarkerField::LastAllowancePayment => "last_allowance_payment",
            MarkerField::LastInterestCalculation => "last_interest_calculation",
        }
    }
}

/// Point-in-time snapshot of one child's ledger document.
///
/// Transactions live alongside the document and are read separately; the
/// balance is maintained incrementally by the store and never replayed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildLedger {
    pub id: String,
    pub family_id: String,
    pub name: String,
    pub balance: Decimal,
    pub cash_box_balance: Decimal,
    pub allowance_config: Option<AllowanceConfig>,
    pub weekly_interest_rate_percent: Option<Decimal>,
    pub last_allowance_payment: Option<DateTime<Utc>>,
    pub last_interest_calculation: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChildLedger {
    /// Generate a unique ID for a child
    pub fn generate_id() -> String {
        format!("child::{}", Uuid::new_v4().simple())
    }

    pub fn marker(&self, field: MarkerField) -> Option<DateTime<Utc>> {
        match field {
            MarkerField::LastAllowancePayment => self.last_allowance_payment,
            MarkerField::LastInterestCalculation => self.last_interest_calculation,
        }
    }

    /// The enabled weekly rate. Absent or zero disables interest; a negative
    /// stored rate is invalid.
    pub fn interest_rate(&self) -> Result<Option<Decimal>, ScheduleError> {
        match self.weekly_interest_rate_percent {
            Some(rate) if rate < Decimal::ZERO => Err(ScheduleError::NegativeInterestRate(rate)),
            Some(rate) if rate > Decimal::ZERO => Ok(Some(rate)),
            _ => Ok(None),
        }
    }
}
