//! Schedule matching for recurring allowance and interest events.
//!
//! Pure functions only. All calendar questions (weekday, day of month,
//! time of day) are answered in the family's local offset; instants are
//! stored and compared in UTC.
//!
//! ## Allowance
//!
//! An allowance occurrence is the scheduled instant on a pay day. It is due
//! while `now` lies in `[occurrence, occurrence + tick_interval)` and the last
//! payment belongs to an earlier period instance. The window only decides
//! *when* inside the period the check becomes active; the period-key
//! comparison is what prevents a second payment.
//!
//! ## Interest
//!
//! Interest is due once a full 24 hours of elapsed time separates `now` from
//! the previous calculation.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use rust_decimal::Decimal;
use shared::AllowancePeriod;

use crate::domain::errors::ScheduleError;
use crate::domain::models::AllowanceConfig;

/// Tick cadence and local offset used to evaluate schedules
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulePolicy {
    pub tick_interval: Duration,
    pub utc_offset: FixedOffset,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            tick_interval: Duration::seconds(60),
            utc_offset: Utc.fix(),
        }
    }
}

/// A validated allowance schedule
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub amount: Decimal,
    pub period: AllowancePeriod,
    pub day_of_period: u32,
    pub time_of_day: NaiveTime,
}

impl Schedule {
    pub fn from_config(config: &AllowanceConfig) -> Result<Self, ScheduleError> {
        let day_valid = match config.period {
            AllowancePeriod::Weekly => AllowanceConfig::is_valid_day_of_week(config.day_of_period),
            AllowancePeriod::Monthly => AllowanceConfig::is_valid_day_of_month(config.day_of_period),
        };
        if !day_valid {
            return Err(ScheduleError::DayOutOfRange {
                period: config.period,
                day: config.day_of_period,
            });
        }
        if config.amount < Decimal::ZERO {
            return Err(ScheduleError::NegativeAmount(config.amount));
        }

        Ok(Self {
            amount: config.amount,
            period: config.period,
            day_of_period: config.day_of_period,
            time_of_day: parse_time_of_day(&config.time_of_day)?,
        })
    }

    /// Whether `date` is a pay day, with month-end clamping for monthly schedules
    pub fn is_pay_day(&self, date: NaiveDate) -> bool {
        match self.period {
            AllowancePeriod::Weekly => date.weekday().num_days_from_sunday() == self.day_of_period,
            AllowancePeriod::Monthly => {
                let last_day = days_in_month(date.year(), date.month());
                date.day() == self.day_of_period.min(last_day)
            }
        }
    }
}

/// Identifies one period instance; ordered chronologically within a period type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeriodKey {
    /// ISO week
    Week { year: i32, week: u32 },
    Month { year: i32, month: u32 },
}

/// Parse a strict 24h "HH:MM" value
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| ScheduleError::InvalidTimeOfDay(value.to_string()))
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first_of_next| first_of_next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

/// Which week or month `instant` falls in, in local time
pub fn current_period_key(period: AllowancePeriod, instant: DateTime<Utc>, offset: FixedOffset) -> PeriodKey {
    let local = instant.with_timezone(&offset).date_naive();
    match period {
        AllowancePeriod::Weekly => {
            let iso = local.iso_week();
            PeriodKey::Week {
                year: iso.year(),
                week: iso.week(),
            }
        }
        AllowancePeriod::Monthly => PeriodKey::Month {
            year: local.year(),
            month: local.month(),
        },
    }
}

/// The scheduled occurrence whose tolerance window contains `now`, if any.
///
/// Checks the previous local day too, so a window that straddles midnight
/// still belongs to the pay day it started on.
pub fn occurrence_in_window(schedule: &Schedule, now: DateTime<Utc>, policy: &SchedulePolicy) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(&policy.utc_offset).date_naive();
    let candidates = [today.pred_opt(), Some(today)];

    candidates
        .into_iter()
        .flatten()
        .filter(|date| schedule.is_pay_day(*date))
        .filter_map(|date| {
            policy
                .utc_offset
                .from_local_datetime(&date.and_time(schedule.time_of_day))
                .single()
                .map(|local| local.with_timezone(&Utc))
        })
        .find(|occurrence| *occurrence <= now && now < *occurrence + policy.tick_interval)
}

/// The allowance occurrence that should be paid at `now`, if any
pub fn due_allowance_occurrence(
    schedule: &Schedule,
    last_payment: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &SchedulePolicy,
) -> Option<DateTime<Utc>> {
    let occurrence = occurrence_in_window(schedule, now, policy)?;
    let occurrence_key = current_period_key(schedule.period, occurrence, policy.utc_offset);

    match last_payment {
        None => Some(occurrence),
        Some(last) if current_period_key(schedule.period, last, policy.utc_offset) < occurrence_key => {
            Some(occurrence)
        }
        Some(_) => None,
    }
}

pub fn is_allowance_due(
    schedule: &Schedule,
    last_payment: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &SchedulePolicy,
) -> bool {
    due_allowance_occurrence(schedule, last_payment, now, policy).is_some()
}

/// True when no calculation happened yet or 24h of elapsed time have passed
pub fn is_interest_due(last_calculation: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_calculation {
        None => true,
        Some(last) => now - last >= Duration::hours(24),
    }
}
