//! # Domain Module
//!
//! Business logic for family ledgers and their recurring events.
//!
//! ## Module Organization
//!
//! - **models**: ledger documents, allowance settings, transactions and their provenance
//! - **money**: fixed-precision currency arithmetic and the daily interest formula
//! - **schedule**: pure period-key and due-window calculations
//! - **idempotency**: fire/no-fire decisions and marker values per event
//! - **accrual_engine**: the per-tick walk over families and children
//! - **ledger_service**: manual deposits and expenses, ledger listing and audit
//! - **scheduler**: the timer loop driving `run_tick`
//!
//! ## Business Rules
//!
//! - At most one allowance per child per week or month
//! - At most one interest posting per child per 24 hours
//! - A balance only moves together with the transaction that explains it
//! - Engine postings are identified by provenance, never by description text
//! - Markers only move forward

pub mod accrual_engine;
pub mod commands;
pub mod errors;
pub mod idempotency;
pub mod ledger_service;
pub mod models;
pub mod money;
pub mod schedule;
pub mod scheduler;

pub use accrual_engine::{AccrualEngine, EngineSettings, EventOutcome, EventRecord, TickReport};
pub use errors::{AccrualError, LedgerError, MoneyError, ScheduleError};
pub use idempotency::{EventState, IdempotencyGuard};
pub use ledger_service::LedgerService;
pub use schedule::{PeriodKey, Schedule, SchedulePolicy};
