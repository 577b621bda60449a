//! Recurring accrual engine.
//!
//! `run_tick(now)` walks every family and child, evaluates allowance and
//! interest eligibility against a fresh snapshot, and posts through the
//! store's marker-guarded append. Nothing here locks: the conditional write
//! is the only concurrency guard, so overlapping ticks from other processes
//! end in `Conflict` rather than a second posting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::AccrualEvent;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::domain::errors::AccrualError;
use crate::domain::idempotency::IdempotencyGuard;
use crate::domain::models::{ChildLedger, MarkerField, NewTransaction};
use crate::domain::money::{daily_interest, round_currency};
use crate::domain::schedule::SchedulePolicy;
use crate::storage::{AppendOutcome, CacheInvalidator, LedgerStore};

/// What happened to one eligible event during a tick
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Posted { transaction_id: String, amount: Decimal },
    /// Positive rate but nothing to pay; only the marker moved
    MarkerAdvanced,
    /// The marker moved under us; someone else handled it
    Conflict,
    InvalidConfig(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub family_id: String,
    pub child_id: String,
    pub event: AccrualEvent,
    pub outcome: EventOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick_at: DateTime<Utc>,
    pub families_processed: u32,
    pub families_failed: u32,
    pub children_processed: u32,
    /// Children whose snapshot could not be loaded or whose task died
    pub child_failures: u32,
    /// `list_families` itself failed; nothing was processed
    pub listing_failed: bool,
    pub events: Vec<EventRecord>,
}

impl TickReport {
    fn new(tick_at: DateTime<Utc>) -> Self {
        Self {
            tick_at,
            families_processed: 0,
            families_failed: 0,
            children_processed: 0,
            child_failures: 0,
            listing_failed: false,
            events: Vec::new(),
        }
    }

    pub fn posted(&self, event: AccrualEvent) -> usize {
        self.events
            .iter()
            .filter(|r| r.event == event && matches!(r.outcome, EventOutcome::Posted { .. }))
            .count()
    }

    pub fn count(&self, predicate: impl Fn(&EventOutcome) -> bool) -> usize {
        self.events.iter().filter(|r| predicate(&r.outcome)).count()
    }

    pub fn total_posted(&self) -> Decimal {
        self.events
            .iter()
            .filter_map(|r| match &r.outcome {
                EventOutcome::Posted { amount, .. } => Some(*amount),
                _ => None,
            })
            .sum()
    }

    pub fn has_failures(&self) -> bool {
        self.listing_failed
            || self.families_failed > 0
            || self.child_failures > 0
            || self.count(|o| matches!(o, EventOutcome::Failed(_))) > 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub policy: SchedulePolicy,
    /// Upper bound for every individual store or cache call
    pub store_call_timeout: Duration,
    /// Children of one family processed in parallel
    pub max_concurrent_children: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: SchedulePolicy::default(),
            store_call_timeout: Duration::from_secs(10),
            max_concurrent_children: 4,
        }
    }
}

/// Per-child result collected from a worker task
struct ChildReport {
    events: Vec<EventRecord>,
    processed: bool,
}

#[derive(Clone)]
pub struct AccrualEngine {
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn CacheInvalidator>,
    guard: IdempotencyGuard,
    settings: EngineSettings,
}

impl AccrualEngine {
    pub fn new(store: Arc<dyn LedgerStore>, cache: Arc<dyn CacheInvalidator>, settings: EngineSettings) -> Self {
        Self {
            store,
            cache,
            guard: IdempotencyGuard::new(settings.policy),
            settings,
        }
    }

    /// Evaluate and post every due event as of `now`.
    ///
    /// Never fails: every error is logged and recorded in the report, and the
    /// next tick re-evaluates from the stored markers.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::new(now);

        let families = match self.call_store("list_families", self.store.list_families()).await {
            Ok(families) => families,
            Err(cause) => {
                error!(cause = %cause, "Failed to list families; skipping tick");
                report.listing_failed = true;
                return report;
            }
        };

        for family_id in families {
            match self.process_family(&family_id, now).await {
                Ok(children) => {
                    report.families_processed += 1;
                    for child in children {
                        if child.processed {
                            report.children_processed += 1;
                        } else {
                            report.child_failures += 1;
                        }
                        report.events.extend(child.events);
                    }
                }
                Err(cause) => {
                    error!(family_id = %family_id, cause = %cause, "Failed to list children");
                    report.families_failed += 1;
                }
            }
        }

        report
    }

    async fn process_family(&self, family_id: &str, now: DateTime<Utc>) -> Result<Vec<ChildReport>, AccrualError> {
        let children = self
            .call_store("list_children", self.store.list_children(family_id))
            .await?;
        debug!(family_id, children = children.len(), "Processing family");

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_children.max(1)));
        let mut workers = JoinSet::new();

        for child in children {
            let engine = self.clone();
            let permits = Arc::clone(&permits);
            let family_id = family_id.to_string();
            workers.spawn(async move {
                // The semaphore is never closed, so acquisition only waits
                let _permit = permits.acquire_owned().await.ok();
                engine.process_child(&family_id, &child.id, now).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(join_error) => {
                    error!(family_id, cause = %join_error, "Child worker terminated abnormally");
                    reports.push(ChildReport {
                        events: Vec::new(),
                        processed: false,
                    });
                }
            }
        }
        Ok(reports)
    }

    async fn process_child(&self, family_id: &str, child_id: &str, now: DateTime<Utc>) -> ChildReport {
        // Listing data may be stale by now; decide from a fresh read
        let child = match self.call_store("get_child", self.store.get_child(family_id, child_id)).await {
            Ok(Some(child)) => child,
            Ok(None) => {
                debug!(family_id, child_id, "Child disappeared before processing");
                return ChildReport {
                    events: Vec::new(),
                    processed: true,
                };
            }
            Err(cause) => {
                error!(family_id, child_id, cause = %cause, "Failed to load child snapshot");
                return ChildReport {
                    events: Vec::new(),
                    processed: false,
                };
            }
        };

        debug!(
            family_id,
            child_id,
            allowance = ?self.guard.state(AccrualEvent::Allowance, &child, now).ok(),
            interest = ?self.guard.state(AccrualEvent::Interest, &child, now).ok(),
            "Evaluating child"
        );

        let mut events = Vec::new();
        let mut record = |event: AccrualEvent, outcome: EventOutcome| {
            events.push(EventRecord {
                family_id: family_id.to_string(),
                child_id: child_id.to_string(),
                event,
                outcome,
            });
        };

        // Both events read the same snapshot; interest ignores this tick's allowance
        if let Some(outcome) = self.process_allowance(&child, now).await {
            record(AccrualEvent::Allowance, outcome);
        }
        if let Some(outcome) = self.process_interest(&child, now).await {
            record(AccrualEvent::Interest, outcome);
        }

        ChildReport { events, processed: true }
    }

    async fn process_allowance(&self, child: &ChildLedger, now: DateTime<Utc>) -> Option<EventOutcome> {
        let occurrence = match self.guard.should_fire_allowance(child, now) {
            Ok(Some(occurrence)) => occurrence,
            Ok(None) => return None,
            Err(schedule_error) => return Some(skip_invalid(child, AccrualEvent::Allowance, schedule_error.into())),
        };

        let config = child.allowance_config.as_ref()?;
        let transaction = NewTransaction::allowance(round_currency(config.amount), now, config.period);
        let marker = self.guard.marker_after_allowance(occurrence);

        Some(self.post(child, AccrualEvent::Allowance, Some(transaction), marker).await)
    }

    async fn process_interest(&self, child: &ChildLedger, now: DateTime<Utc>) -> Option<EventOutcome> {
        let rate = match self.guard.should_fire_interest(child, now) {
            Ok(Some(rate)) => rate,
            Ok(None) => return None,
            Err(schedule_error) => return Some(skip_invalid(child, AccrualEvent::Interest, schedule_error.into())),
        };

        let amount = match daily_interest(child.balance, rate) {
            Ok(amount) => amount,
            Err(money_error) => return Some(skip_invalid(child, AccrualEvent::Interest, money_error.into())),
        };
        let transaction = (amount > Decimal::ZERO).then(|| NewTransaction::interest(amount, now));
        let marker = self.guard.marker_after_interest(now);

        Some(self.post(child, AccrualEvent::Interest, transaction, marker).await)
    }

    /// Marker-guarded append against the marker value read in the snapshot
    async fn post(
        &self,
        child: &ChildLedger,
        event: AccrualEvent,
        transaction: Option<NewTransaction>,
        new_marker: DateTime<Utc>,
    ) -> EventOutcome {
        let field = MarkerField::for_event(event);
        let expected = child.marker(field);

        let result = self
            .call_store(
                "append_transaction_if_marker_unchanged",
                self.store.append_transaction_if_marker_unchanged(
                    &child.family_id,
                    &child.id,
                    transaction.as_ref(),
                    field,
                    expected,
                    new_marker,
                ),
            )
            .await;

        match result {
            Ok(AppendOutcome::Applied) => {
                self.invalidate(&child.family_id, &child.id).await;
                match transaction {
                    Some(transaction) => {
                        info!(
                            family_id = %child.family_id,
                            child_id = %child.id,
                            event = %event,
                            amount = %transaction.amount(),
                            transaction_id = transaction.id(),
                            "Posted recurring transaction"
                        );
                        EventOutcome::Posted {
                            transaction_id: transaction.id().to_string(),
                            amount: transaction.amount(),
                        }
                    }
                    None => {
                        debug!(family_id = %child.family_id, child_id = %child.id, event = %event, "Advanced marker without posting");
                        EventOutcome::MarkerAdvanced
                    }
                }
            }
            Ok(AppendOutcome::Conflict) => {
                debug!(family_id = %child.family_id, child_id = %child.id, event = %event, "Marker changed concurrently; skipping");
                EventOutcome::Conflict
            }
            Err(cause) => {
                error!(
                    family_id = %child.family_id,
                    child_id = %child.id,
                    event = %event,
                    cause = %cause,
                    "Failed to post recurring transaction; will retry next tick"
                );
                EventOutcome::Failed(cause.to_string())
            }
        }
    }

    /// Fire-and-forget; failures are logged and never affect the outcome
    async fn invalidate(&self, family_id: &str, child_id: &str) {
        match tokio::time::timeout(self.settings.store_call_timeout, self.cache.invalidate(family_id, child_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(cause)) => warn!(family_id, child_id, cause = %cause, "Cache invalidation failed"),
            Err(_) => warn!(family_id, child_id, "Cache invalidation timed out"),
        }
    }

    async fn call_store<T, F>(&self, operation: &'static str, call: F) -> Result<T, AccrualError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let timeout = self.settings.store_call_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map_err(AccrualError::from_store),
            Err(_) => Err(AccrualError::StoreTimeout { operation, timeout }),
        }
    }
}

/// Stored settings that cannot be evaluated; reported on every tick until fixed
fn skip_invalid(child: &ChildLedger, event: AccrualEvent, cause: AccrualError) -> EventOutcome {
    warn!(
        family_id = %child.family_id,
        child_id = %child.id,
        event = %event,
        cause = %cause,
        "Skipping event with invalid configuration"
    );
    EventOutcome::InvalidConfig(cause.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AllowanceConfig, LedgerTransaction};
    use crate::storage::test_utils::TestEnvironment;
    use crate::storage::{NoopCacheInvalidator, SqliteLedgerStore};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{Datelike, Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;
    use shared::{AllowancePeriod, TransactionSource, TransactionType};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn monday_allowance() -> AllowanceConfig {
        AllowanceConfig {
            amount: dec!(50),
            period: AllowancePeriod::Weekly,
            day_of_period: 1,
            time_of_day: "08:00".to_string(),
            is_active: true,
        }
    }

    fn engine_for(store: Arc<dyn LedgerStore>, cache: Arc<dyn CacheInvalidator>) -> AccrualEngine {
        let settings = EngineSettings {
            store_call_timeout: Duration::from_millis(500),
            ..EngineSettings::default()
        };
        AccrualEngine::new(store, cache, settings)
    }

    fn engine(env: &TestEnvironment) -> AccrualEngine {
        engine_for(env.store.clone(), Arc::new(NoopCacheInvalidator))
    }

    async fn transactions(env: &TestEnvironment, child: &ChildLedger) -> Vec<LedgerTransaction> {
        env.store
            .list_transactions(&child.family_id, &child.id, None)
            .await
            .unwrap()
    }

    /// Records invalidations, optionally failing every call
    #[derive(Default)]
    struct RecordingInvalidator {
        calls: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl CacheInvalidator for RecordingInvalidator {
        async fn invalidate(&self, family_id: &str, child_id: &str) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((family_id.to_string(), child_id.to_string()));
            if self.fail {
                return Err(anyhow!("cache unavailable"));
            }
            Ok(())
        }
    }

    /// Delegates to SQLite but fails or hangs for selected children
    struct FaultyStore {
        inner: Arc<SqliteLedgerStore>,
        failing_children: HashSet<String>,
        hanging_children: HashSet<String>,
        fail_listing: bool,
    }

    impl FaultyStore {
        fn new(inner: Arc<SqliteLedgerStore>) -> Self {
            Self {
                inner,
                failing_children: HashSet::new(),
                hanging_children: HashSet::new(),
                fail_listing: false,
            }
        }

        async fn check(&self, child_id: &str) -> anyhow::Result<()> {
            if self.hanging_children.contains(child_id) {
                std::future::pending::<()>().await;
            }
            if self.failing_children.contains(child_id) {
                return Err(anyhow!("store unavailable"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LedgerStore for FaultyStore {
        async fn list_families(&self) -> anyhow::Result<Vec<String>> {
            if self.fail_listing {
                return Err(anyhow!("listing unavailable"));
            }
            self.inner.list_families().await
        }

        async fn list_children(&self, family_id: &str) -> anyhow::Result<Vec<ChildLedger>> {
            self.inner.list_children(family_id).await
        }

        async fn get_child(&self, family_id: &str, child_id: &str) -> anyhow::Result<Option<ChildLedger>> {
            self.inner.get_child(family_id, child_id).await
        }

        async fn append_transaction_if_marker_unchanged(
            &self,
            family_id: &str,
            child_id: &str,
            transaction: Option<&NewTransaction>,
            marker: MarkerField,
            expected_old_marker: Option<DateTime<Utc>>,
            new_marker: DateTime<Utc>,
        ) -> anyhow::Result<AppendOutcome> {
            self.check(child_id).await?;
            self.inner
                .append_transaction_if_marker_unchanged(
                    family_id,
                    child_id,
                    transaction,
                    marker,
                    expected_old_marker,
                    new_marker,
                )
                .await
        }

        async fn append_transaction(
            &self,
            family_id: &str,
            child_id: &str,
            transaction: &NewTransaction,
        ) -> anyhow::Result<()> {
            self.inner.append_transaction(family_id, child_id, transaction).await
        }

        async fn list_transactions(
            &self,
            family_id: &str,
            child_id: &str,
            limit: Option<u32>,
        ) -> anyhow::Result<Vec<LedgerTransaction>> {
            self.inner.list_transactions(family_id, child_id, limit).await
        }
    }

    #[tokio::test]
    async fn test_weekly_allowance_posts_once_per_week() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.configure(&child, Some(monday_allowance()), None).await.unwrap();
        let engine = engine(&env);

        let monday = at(2024, 1, 8, 8, 0);
        let report = engine.run_tick(monday).await;
        assert_eq!(report.posted(AccrualEvent::Allowance), 1);

        let reloaded = env.reload(&child).await.unwrap();
        assert_eq!(reloaded.balance, dec!(50));
        assert_eq!(reloaded.last_allowance_payment, Some(monday));

        // Same tick replayed and the next minute: nothing new
        assert!(engine.run_tick(monday).await.events.is_empty());
        assert!(engine.run_tick(at(2024, 1, 8, 8, 1)).await.events.is_empty());
        assert_eq!(transactions(&env, &child).await.len(), 1);

        let next_monday = at(2024, 1, 15, 8, 0);
        assert_eq!(engine.run_tick(next_monday).await.posted(AccrualEvent::Allowance), 1);

        let posted = transactions(&env, &child).await;
        assert_eq!(posted.len(), 2);
        assert!(posted.iter().all(|t| t.engine_source() == Some(TransactionSource::Allowance)));
        assert!(posted.iter().all(|t| t.transaction_type == TransactionType::Deposit));
        assert_eq!(env.reload(&child).await.unwrap().balance, dec!(100));
    }

    #[tokio::test]
    async fn test_late_tick_in_window_records_occurrence_as_marker() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.configure(&child, Some(monday_allowance()), None).await.unwrap();

        let late = at(2024, 1, 8, 8, 0) + ChronoDuration::seconds(42);
        engine(&env).run_tick(late).await;

        let reloaded = env.reload(&child).await.unwrap();
        assert_eq!(reloaded.last_allowance_payment, Some(at(2024, 1, 8, 8, 0)));
        assert_eq!(transactions(&env, &child).await[0].timestamp, late);
    }

    #[tokio::test]
    async fn test_monthly_day_31_pays_on_last_day_of_short_month() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Omer").await.unwrap();
        let config = AllowanceConfig {
            amount: dec!(20),
            period: AllowancePeriod::Monthly,
            day_of_period: 31,
            time_of_day: "08:00".to_string(),
            is_active: true,
        };
        env.configure(&child, Some(config), None).await.unwrap();
        let engine = engine(&env);

        assert!(engine.run_tick(at(2024, 4, 29, 8, 0)).await.events.is_empty());
        assert_eq!(engine.run_tick(at(2024, 4, 30, 8, 0)).await.posted(AccrualEvent::Allowance), 1);
        assert!(engine.run_tick(at(2024, 4, 30, 8, 0)).await.events.is_empty());
        assert_eq!(engine.run_tick(at(2024, 5, 31, 8, 0)).await.posted(AccrualEvent::Allowance), 1);
        assert_eq!(env.reload(&child).await.unwrap().balance, dec!(40));
    }

    #[tokio::test]
    async fn test_interest_compounds_daily() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Noa").await.unwrap();
        env.deposit(&child, dec!(100.00)).await.unwrap();
        env.configure(&child, None, Some(dec!(7))).await.unwrap();
        let engine = engine(&env);

        let start = at(2024, 1, 8, 9, 0);
        let mut expected_total = Decimal::ZERO;
        for day in 0..7 {
            let balance = env.reload(&child).await.unwrap().balance;
            let expected = daily_interest(balance, dec!(7)).unwrap();
            expected_total += expected;

            let report = engine.run_tick(start + ChronoDuration::days(day)).await;
            assert_eq!(report.total_posted(), expected);

            // A second tick a minute later is inside the same 24h
            let again = engine.run_tick(start + ChronoDuration::days(day) + ChronoDuration::minutes(1)).await;
            assert!(again.events.is_empty());
        }

        assert_eq!(expected_total, dec!(7.21));
        assert_eq!(env.reload(&child).await.unwrap().balance, dec!(107.21));

        let interest: Vec<_> = transactions(&env, &child)
            .await
            .into_iter()
            .filter(|t| t.engine_source() == Some(TransactionSource::Interest))
            .collect();
        assert_eq!(interest.len(), 7);
    }

    #[tokio::test]
    async fn test_interest_boundary_is_24_hours_of_elapsed_time() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Noa").await.unwrap();
        env.deposit(&child, dec!(700.00)).await.unwrap();
        env.configure(&child, None, Some(dec!(7))).await.unwrap();
        let last = at(2024, 1, 8, 9, 0);
        env.set_marker(&child.id, MarkerField::LastInterestCalculation, Some(last))
            .await
            .unwrap();
        let engine = engine(&env);

        let early = engine.run_tick(last + ChronoDuration::hours(24) - ChronoDuration::seconds(1)).await;
        assert!(early.events.is_empty());

        let due = engine.run_tick(last + ChronoDuration::hours(24)).await;
        assert_eq!(due.total_posted(), dec!(7.00));
    }

    #[tokio::test]
    async fn test_tiny_interest_advances_marker_without_posting() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Noa").await.unwrap();
        env.deposit(&child, dec!(0.10)).await.unwrap();
        env.configure(&child, None, Some(dec!(1))).await.unwrap();

        let now = at(2024, 1, 8, 9, 0);
        let report = engine(&env).run_tick(now).await;
        assert_eq!(report.events[0].outcome, EventOutcome::MarkerAdvanced);

        let reloaded = env.reload(&child).await.unwrap();
        assert_eq!(reloaded.last_interest_calculation, Some(now));
        assert_eq!(reloaded.balance, dec!(0.10));
        assert_eq!(transactions(&env, &child).await.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_rate_and_inactive_allowance_write_nothing() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Noa").await.unwrap();
        let mut inactive = monday_allowance();
        inactive.is_active = false;
        env.configure(&child, Some(inactive), Some(Decimal::ZERO)).await.unwrap();

        let report = engine(&env).run_tick(at(2024, 1, 8, 8, 0)).await;
        assert!(report.events.is_empty());
        assert_eq!(report.children_processed, 1);

        let reloaded = env.reload(&child).await.unwrap();
        assert_eq!(reloaded.last_interest_calculation, None);
        assert_eq!(reloaded.last_allowance_payment, None);
    }

    #[tokio::test]
    async fn test_allowance_and_interest_in_same_tick_use_snapshot_balance() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.deposit(&child, dec!(100.00)).await.unwrap();
        env.configure(&child, Some(monday_allowance()), Some(dec!(7))).await.unwrap();

        let report = engine(&env).run_tick(at(2024, 1, 8, 8, 0)).await;
        assert_eq!(report.posted(AccrualEvent::Allowance), 1);
        assert_eq!(report.posted(AccrualEvent::Interest), 1);
        // Interest on 100.00, not on 150.00
        assert_eq!(report.total_posted(), dec!(51.00));
        assert_eq!(env.reload(&child).await.unwrap().balance, dec!(151.00));
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_reported_and_interest_still_runs() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.deposit(&child, dec!(70.00)).await.unwrap();
        let mut broken = monday_allowance();
        broken.time_of_day = "8 o'clock".to_string();
        env.configure(&child, Some(broken), Some(dec!(7))).await.unwrap();

        let report = engine(&env).run_tick(at(2024, 1, 8, 8, 0)).await;
        assert_eq!(report.count(|o| matches!(o, EventOutcome::InvalidConfig(_))), 1);
        assert_eq!(report.posted(AccrualEvent::Interest), 1);
        assert_eq!(env.reload(&child).await.unwrap().last_allowance_payment, None);
    }

    #[tokio::test]
    async fn test_negative_rate_is_reported_and_writes_nothing() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.deposit(&child, dec!(70.00)).await.unwrap();
        env.configure(&child, Some(monday_allowance()), Some(dec!(-1))).await.unwrap();
        let engine = engine(&env);

        let report = engine.run_tick(at(2024, 1, 8, 8, 0)).await;
        assert_eq!(report.posted(AccrualEvent::Allowance), 1);
        assert_eq!(report.events.len(), 2);
        assert!(matches!(
            &report.events[1],
            EventRecord {
                event: AccrualEvent::Interest,
                outcome: EventOutcome::InvalidConfig(_),
                ..
            }
        ));
        assert!(!report.has_failures());

        // Reported again on later ticks until the rate is fixed
        let later = engine.run_tick(at(2024, 1, 9, 8, 0)).await;
        assert_eq!(later.count(|o| matches!(o, EventOutcome::InvalidConfig(_))), 1);

        let reloaded = env.reload(&child).await.unwrap();
        assert_eq!(reloaded.last_interest_calculation, None);
        assert_eq!(reloaded.balance, dec!(120.00));
    }

    #[tokio::test]
    async fn test_out_of_range_rate_is_reported_instead_of_panicking() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Noa").await.unwrap();
        env.deposit(&child, dec!(100.00)).await.unwrap();
        env.configure(&child, None, Some(Decimal::MAX)).await.unwrap();

        let report = engine(&env).run_tick(at(2024, 1, 8, 9, 0)).await;
        assert_eq!(report.children_processed, 1);
        assert_eq!(report.child_failures, 0);
        assert_eq!(report.count(|o| matches!(o, EventOutcome::InvalidConfig(_))), 1);

        let reloaded = env.reload(&child).await.unwrap();
        assert_eq!(reloaded.last_interest_calculation, None);
        assert_eq!(reloaded.balance, dec!(100.00));
    }

    #[tokio::test]
    async fn test_dense_repeated_ticks_over_two_weeks_post_once_per_period() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.deposit(&child, dec!(100.00)).await.unwrap();
        // Sunday 23:59 with a 90s window: paid by the tick just after midnight
        let late_sunday = AllowanceConfig {
            day_of_period: 0,
            time_of_day: "23:59".to_string(),
            ..monday_allowance()
        };
        env.configure(&child, Some(late_sunday), Some(dec!(7))).await.unwrap();

        let step = ChronoDuration::seconds(90);
        let settings = EngineSettings {
            policy: SchedulePolicy {
                tick_interval: step,
                ..SchedulePolicy::default()
            },
            store_call_timeout: Duration::from_secs(5),
            ..EngineSettings::default()
        };
        let engine = AccrualEngine::new(env.store.clone(), Arc::new(NoopCacheInvalidator), settings);

        // Starts past the 2024-01-07 window; ends on the tick paying 2024-01-21
        let end = at(2024, 1, 22, 0, 0);
        let mut now = at(2024, 1, 8, 0, 0) + step;
        while now <= end {
            engine.run_tick(now).await;
            engine.run_tick(now).await;
            now += step;
        }

        let posted = transactions(&env, &child).await;
        let allowance_weeks: Vec<_> = posted
            .iter()
            .filter(|t| t.engine_source() == Some(TransactionSource::Allowance))
            .map(|t| t.timestamp.iso_week())
            .collect();
        let distinct_weeks: HashSet<_> = allowance_weeks.iter().collect();
        assert_eq!(allowance_weeks.len(), 2);
        assert_eq!(distinct_weeks.len(), 2);
        assert_eq!(
            env.reload(&child).await.unwrap().last_allowance_payment,
            Some(at(2024, 1, 21, 23, 59))
        );

        let interest_days: Vec<_> = posted
            .iter()
            .filter(|t| t.engine_source() == Some(TransactionSource::Interest))
            .map(|t| t.timestamp.date_naive())
            .collect();
        let distinct_days: HashSet<_> = interest_days.iter().collect();
        assert_eq!(interest_days.len(), distinct_days.len());
        assert_eq!(distinct_days.len(), 14);
    }

    #[tokio::test]
    async fn test_stale_snapshot_marker_results_in_conflict() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.configure(&child, Some(monday_allowance()), None).await.unwrap();
        let snapshot = env.reload(&child).await.unwrap();

        // Another process pays between our read and our write
        let other = NewTransaction::allowance(dec!(50), at(2024, 1, 8, 8, 0), AllowancePeriod::Weekly);
        env.store
            .append_transaction_if_marker_unchanged(
                &child.family_id,
                &child.id,
                Some(&other),
                MarkerField::LastAllowancePayment,
                None,
                at(2024, 1, 8, 8, 0),
            )
            .await
            .unwrap();

        let engine = engine(&env);
        let outcome = engine
            .post(
                &snapshot,
                AccrualEvent::Allowance,
                Some(NewTransaction::allowance(dec!(50), at(2024, 1, 8, 8, 0), AllowancePeriod::Weekly)),
                at(2024, 1, 8, 8, 0),
            )
            .await;
        assert_eq!(outcome, EventOutcome::Conflict);
        assert_eq!(env.reload(&child).await.unwrap().balance, dec!(50));
    }

    #[tokio::test]
    async fn test_overlapping_ticks_post_once() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.configure(&child, Some(monday_allowance()), Some(dec!(7))).await.unwrap();
        env.deposit(&child, dec!(100.00)).await.unwrap();
        let first = engine(&env);
        let second = engine(&env);

        let now = at(2024, 1, 8, 8, 0);
        let (a, b) = tokio::join!(first.run_tick(now), second.run_tick(now));

        assert_eq!(a.posted(AccrualEvent::Allowance) + b.posted(AccrualEvent::Allowance), 1);
        assert_eq!(a.posted(AccrualEvent::Interest) + b.posted(AccrualEvent::Interest), 1);

        let posted = transactions(&env, &child).await;
        assert_eq!(posted.len(), 3);
        let replayed: Decimal = posted.iter().map(|t| t.signed_amount()).sum();
        assert_eq!(env.reload(&child).await.unwrap().balance, replayed);
    }

    #[tokio::test]
    async fn test_store_failure_for_one_child_does_not_stop_siblings() {
        let env = TestEnvironment::new().await.unwrap();
        let (family, broken) = env.family_with_child("Broken").await.unwrap();
        let healthy = env.store.create_child(&family.id, "Healthy").await.unwrap();
        let other_family = env.store.create_family("Other").await.unwrap();
        let cousin = env.store.create_child(&other_family.id, "Cousin").await.unwrap();
        for child in [&broken, &healthy, &cousin] {
            env.configure(child, Some(monday_allowance()), None).await.unwrap();
        }

        let mut store = FaultyStore::new(env.store.clone());
        store.failing_children.insert(broken.id.clone());
        let engine = engine_for(Arc::new(store), Arc::new(NoopCacheInvalidator));

        let report = engine.run_tick(at(2024, 1, 8, 8, 0)).await;
        assert_eq!(report.families_processed, 2);
        assert_eq!(report.posted(AccrualEvent::Allowance), 2);
        assert_eq!(report.count(|o| matches!(o, EventOutcome::Failed(_))), 1);
        assert!(report.has_failures());

        // Marker never advanced, so the broken child is retried next tick
        assert_eq!(env.reload(&broken).await.unwrap().last_allowance_payment, None);
        let retry = engine_for(env.store.clone(), Arc::new(NoopCacheInvalidator))
            .run_tick(at(2024, 1, 8, 8, 0))
            .await;
        assert_eq!(retry.posted(AccrualEvent::Allowance), 1);
        assert_eq!(env.reload(&broken).await.unwrap().balance, dec!(50));
    }

    #[tokio::test]
    async fn test_hanging_store_call_times_out() {
        let env = TestEnvironment::new().await.unwrap();
        let (family, stuck) = env.family_with_child("Stuck").await.unwrap();
        let healthy = env.store.create_child(&family.id, "Healthy").await.unwrap();
        for child in [&stuck, &healthy] {
            env.configure(child, Some(monday_allowance()), None).await.unwrap();
        }

        let mut store = FaultyStore::new(env.store.clone());
        store.hanging_children.insert(stuck.id.clone());
        let engine = engine_for(Arc::new(store), Arc::new(NoopCacheInvalidator));

        let report = engine.run_tick(at(2024, 1, 8, 8, 0)).await;
        assert_eq!(report.posted(AccrualEvent::Allowance), 1);
        let failed: Vec<_> = report
            .events
            .iter()
            .filter(|r| matches!(r.outcome, EventOutcome::Failed(_)))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].child_id, stuck.id);
        assert!(matches!(&failed[0].outcome, EventOutcome::Failed(reason) if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn test_listing_failure_is_contained() {
        let env = TestEnvironment::new().await.unwrap();
        let mut store = FaultyStore::new(env.store.clone());
        store.fail_listing = true;
        let engine = engine_for(Arc::new(store), Arc::new(NoopCacheInvalidator));

        let report = engine.run_tick(at(2024, 1, 8, 8, 0)).await;
        assert!(report.listing_failed);
        assert!(report.events.is_empty());
    }

    #[tokio::test]
    async fn test_invalidation_follows_every_successful_write() {
        let env = TestEnvironment::new().await.unwrap();
        let (family, child) = env.family_with_child("Maya").await.unwrap();
        env.deposit(&child, dec!(100.00)).await.unwrap();
        env.configure(&child, Some(monday_allowance()), Some(dec!(7))).await.unwrap();

        let invalidator = Arc::new(RecordingInvalidator::default());
        let engine = engine_for(env.store.clone(), invalidator.clone());
        engine.run_tick(at(2024, 1, 8, 8, 0)).await;
        engine.run_tick(at(2024, 1, 8, 8, 0)).await;

        let calls = invalidator.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(f, c)| *f == family.id && *c == child.id));
    }

    #[tokio::test]
    async fn test_invalidation_failure_does_not_fail_the_posting() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.configure(&child, Some(monday_allowance()), None).await.unwrap();

        let invalidator = Arc::new(RecordingInvalidator {
            fail: true,
            ..RecordingInvalidator::default()
        });
        let engine = engine_for(env.store.clone(), invalidator);

        let report = engine.run_tick(at(2024, 1, 8, 8, 0)).await;
        assert_eq!(report.posted(AccrualEvent::Allowance), 1);
        assert!(!report.has_failures());
    }

    #[tokio::test]
    async fn test_archived_children_are_skipped() {
        let env = TestEnvironment::new().await.unwrap();
        let (family, child) = env.family_with_child("Maya").await.unwrap();
        env.configure(&child, Some(monday_allowance()), None).await.unwrap();
        env.store.archive_child(&family.id, &child.id).await.unwrap();

        let report = engine(&env).run_tick(at(2024, 1, 8, 8, 0)).await;
        assert_eq!(report.children_processed, 0);
        assert_eq!(env.reload(&child).await.unwrap().balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_manual_and_engine_writes_conserve_balance() {
        let env = TestEnvironment::new().await.unwrap();
        let (_, child) = env.family_with_child("Maya").await.unwrap();
        env.configure(&child, Some(monday_allowance()), Some(dec!(3))).await.unwrap();
        let engine = engine(&env);

        let start = at(2024, 1, 8, 8, 0);
        let _ = tokio::join!(engine.run_tick(start), async {
            for amount in [dec!(10.00), dec!(2.50)] {
                env.deposit(&child, amount).await.unwrap();
            }
        });
        engine.run_tick(start + ChronoDuration::days(1)).await;

        let expense = NewTransaction::manual(TransactionType::Expense, dec!(4.75), Utc::now(), "Snack");
        env.store
            .append_transaction(&child.family_id, &child.id, &expense)
            .await
            .unwrap();

        let replayed: Decimal = transactions(&env, &child).await.iter().map(|t| t.signed_amount()).sum();
        assert_eq!(env.reload(&child).await.unwrap().balance, replayed);
    }
}
