//! Currency arithmetic on fixed-scale decimals.
//!
//! Balances and interest never go through binary floating point. The ledger
//! keeps two decimal places; storage uses integer minor units (cents).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::errors::MoneyError;

/// Decimal places kept for every stored amount
pub const CURRENCY_SCALE: u32 = 2;

const DAYS_PER_WEEK: Decimal = Decimal::from_parts(7, 0, 0, false, 0);

/// Round to the ledger's currency precision, halves away from zero
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Daily interest for a weekly percentage rate.
///
/// `round(balance * rate / 100 / 7)`; the caller skips non-positive results.
/// Fails instead of panicking when the product leaves `Decimal`'s range.
pub fn daily_interest(balance: Decimal, weekly_rate_percent: Decimal) -> Result<Decimal, MoneyError> {
    balance
        .checked_mul(weekly_rate_percent)
        .and_then(|product| product.checked_div(Decimal::ONE_HUNDRED))
        .and_then(|weekly| weekly.checked_div(DAYS_PER_WEEK))
        .map(round_currency)
        .ok_or(MoneyError::InterestOverflow {
            balance,
            rate: weekly_rate_percent,
        })
}

/// Reject amounts that cannot be posted as a transaction
pub fn validate_posting_amount(amount: Decimal) -> Result<(), MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::NonPositive(amount));
    }
    if amount.normalize().scale() > CURRENCY_SCALE {
        return Err(MoneyError::TooPrecise(amount));
    }
    Ok(())
}

/// Convert to integer cents, refusing to drop precision
pub fn to_minor_units(amount: Decimal) -> Result<i64, MoneyError> {
    if amount.normalize().scale() > CURRENCY_SCALE {
        return Err(MoneyError::TooPrecise(amount));
    }
    (amount * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or(MoneyError::Overflow(amount))
}

pub fn from_minor_units(minor_units: i64) -> Decimal {
    Decimal::new(minor_units, CURRENCY_SCALE)
}
