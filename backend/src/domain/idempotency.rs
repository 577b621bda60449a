//! Exactly-once decisions for recurring events.
//!
//! The guard reads a child snapshot and answers two questions per event:
//! should it fire now, and which marker value records that it fired. The
//! store's conditional write turns those answers into an exactly-once
//! posting; the guard itself holds no state between ticks.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::AccrualEvent;

use crate::domain::errors::ScheduleError;
use crate::domain::models::ChildLedger;
use crate::domain::schedule::{self, Schedule, SchedulePolicy};

/// Per-child, per-event lifecycle as seen at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// No schedule, inactive, zero amount or zero rate
    Disabled,
    /// Configured but not inside a due window
    Pending,
    /// Due for the current period and not yet posted
    Eligible,
    /// Already posted for the current period
    Posted,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyGuard {
    policy: SchedulePolicy,
}

impl IdempotencyGuard {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self { policy }
    }

    /// The enabled allowance schedule for a child, if any.
    ///
    /// Inactive or zero-amount configurations are disabled, not invalid.
    pub fn allowance_schedule(&self, child: &ChildLedger) -> Result<Option<Schedule>, ScheduleError> {
        let Some(config) = child.allowance_config.as_ref() else {
            return Ok(None);
        };
        if !config.is_active || config.amount.is_zero() {
            return Ok(None);
        }
        Schedule::from_config(config).map(Some)
    }

    /// The occurrence to pay at `now`, or `None` when nothing is due
    pub fn should_fire_allowance(
        &self,
        child: &ChildLedger,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let Some(schedule) = self.allowance_schedule(child)? else {
            return Ok(None);
        };
        Ok(schedule::due_allowance_occurrence(
            &schedule,
            child.last_allowance_payment,
            now,
            &self.policy,
        ))
    }

    /// The rate to charge at `now`, or `None` when interest is disabled or
    /// not yet due
    pub fn should_fire_interest(&self, child: &ChildLedger, now: DateTime<Utc>) -> Result<Option<Decimal>, ScheduleError> {
        let Some(rate) = child.interest_rate()? else {
            return Ok(None);
        };
        Ok(schedule::is_interest_due(child.last_interest_calculation, now).then_some(rate))
    }

    /// Marker written together with an allowance posting.
    ///
    /// The occurrence instant, so the marker's period key is always the
    /// period that was paid.
    pub fn marker_after_allowance(&self, occurrence: DateTime<Utc>) -> DateTime<Utc> {
        occurrence
    }

    pub fn marker_after_interest(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now
    }

    pub fn allowance_state(&self, child: &ChildLedger, now: DateTime<Utc>) -> Result<EventState, ScheduleError> {
        let Some(schedule) = self.allowance_schedule(child)? else {
            return Ok(EventState::Disabled);
        };

        let current_key = schedule::current_period_key(schedule.period, now, self.policy.utc_offset);
        let paid_this_period = child.last_allowance_payment.is_some_and(|last| {
            schedule::current_period_key(schedule.period, last, self.policy.utc_offset) >= current_key
        });
        if paid_this_period {
            return Ok(EventState::Posted);
        }

        let due = schedule::due_allowance_occurrence(&schedule, child.last_allowance_payment, now, &self.policy);
        Ok(if due.is_some() {
            EventState::Eligible
        } else {
            EventState::Pending
        })
    }

    pub fn interest_state(&self, child: &ChildLedger, now: DateTime<Utc>) -> Result<EventState, ScheduleError> {
        Ok(if child.interest_rate()?.is_none() {
            EventState::Disabled
        } else if schedule::is_interest_due(child.last_interest_calculation, now) {
            EventState::Eligible
        } else {
            EventState::Posted
        })
    }

    pub fn state(&self, event: AccrualEvent, child: &ChildLedger, now: DateTime<Utc>) -> Result<EventState, ScheduleError> {
        match event {
            AccrualEvent::Allowance => self.allowance_state(child, now),
            AccrualEvent::Interest => self.interest_state(child, now),
        }
    }
}
