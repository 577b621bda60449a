//! Timer driver for the accrual engine.
//!
//! One loop per process. Each tick is awaited before the next interval tick
//! is taken, so ticks never overlap here; overlap across processes is left
//! to the store's conditional write.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::accrual_engine::{AccrualEngine, TickReport};
use crate::io::mappers::TickMapper;

/// Run ticks at `tick_interval` until `shutdown` resolves.
///
/// Returns the number of completed ticks. A tick in progress when shutdown
/// is requested is finished first.
pub async fn run_tick_loop<F>(engine: AccrualEngine, tick_interval: Duration, shutdown: F) -> u64
where
    F: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    info!(interval_secs = tick_interval.as_secs(), "Accrual loop started");
    let mut completed: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(completed, "Shutdown requested; accrual loop stopping");
                break;
            }
            _ = interval.tick() => {
                let report = engine.run_tick(Utc::now()).await;
                log_tick_report(&report);
                completed += 1;
            }
        }
    }

    completed
}

/// One summary line per tick, plus the full summary as JSON at debug level
pub fn log_tick_report(report: &TickReport) {
    let summary = TickMapper::to_summary(report);

    if report.has_failures() {
        warn!(
            tick_at = %summary.tick_at,
            families = summary.families_processed,
            families_failed = summary.families_failed,
            children = summary.children_processed,
            allowances = summary.allowances_posted,
            interest = summary.interest_posted,
            failures = summary.failures,
            listing_failed = summary.listing_failed,
            "Accrual tick finished with failures"
        );
    } else {
        info!(
            tick_at = %summary.tick_at,
            families = summary.families_processed,
            children = summary.children_processed,
            allowances = summary.allowances_posted,
            interest = summary.interest_posted,
            conflicts = summary.conflicts,
            total_posted = %summary.total_posted,
            "Accrual tick finished"
        );
    }

    match serde_json::to_string(&summary) {
        Ok(json) => debug!(summary = %json, "Tick summary"),
        Err(cause) => debug!(cause = %cause, "Could not serialize tick summary"),
    }
}
