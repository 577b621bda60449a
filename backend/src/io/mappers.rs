use chrono::{DateTime, SecondsFormat, Utc};
use shared::{AccrualEvent, TickSummary};

use crate::domain::accrual_engine::{EventOutcome, TickReport};

fn to_rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct TickMapper;

impl TickMapper {
    pub fn to_summary(report: &TickReport) -> TickSummary {
        let mut summary = TickSummary {
            tick_at: to_rfc3339(report.tick_at),
            families_processed: report.families_processed,
            families_failed: report.families_failed,
            children_processed: report.children_processed,
            failures: report.child_failures,
            total_posted: report.total_posted(),
            listing_failed: report.listing_failed,
            ..TickSummary::default()
        };

        for record in &report.events {
            match (&record.outcome, record.event) {
                (EventOutcome::Posted { .. }, AccrualEvent::Allowance) => summary.allowances_posted += 1,
                (EventOutcome::Posted { .. }, AccrualEvent::Interest) => summary.interest_posted += 1,
                (EventOutcome::MarkerAdvanced, _) => summary.markers_advanced += 1,
                (EventOutcome::Conflict, _) => summary.conflicts += 1,
                (EventOutcome::InvalidConfig(_), _) => summary.invalid_configs += 1,
                (EventOutcome::Failed(_), _) => summary.failures += 1,
            }
        }

        summary
    }
}
