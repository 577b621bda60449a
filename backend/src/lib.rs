//! # Family Bank Backend
//!
//! Ledger backend for a family-banking app, centred on the recurring accrual
//! engine that pays allowances and daily interest exactly once per period.
//!
//! ## Architecture Overview
//!
//! - **Domain Layer** (`domain`): schedules, idempotency decisions, the accrual
//!   engine and the manual ledger service
//! - **Storage Layer** (`storage`): the `LedgerStore` abstraction and its
//!   SQLite implementation, plus cache-invalidation hooks
//! - **I/O Layer** (`io`): mappers from domain types to the DTOs in `shared`
//!
//! ## Data Flow
//!
//! 1. The tick loop calls `AccrualEngine::run_tick(now)`
//! 2. The engine lists families and children, then re-reads each child
//! 3. Due events are posted with a marker-guarded append
//! 4. Successful writes fire a cache invalidation
//!
//! Manual deposits and expenses go through `LedgerService` and adjust the
//! same balances relatively, so both paths can run at once.

pub mod config;
pub mod domain;
pub mod io;
pub mod storage;

use anyhow::Result;
use std::fs;
use std::sync::Arc;
use tracing::info;

use config::EngineConfig;
use domain::{AccrualEngine, LedgerService};
use storage::{BroadcastCacheInvalidator, DbConnection, SqliteLedgerStore};

/// Capacity of the invalidation channel; slow subscribers miss older events
const INVALIDATION_CHANNEL_CAPACITY: usize = 256;

/// Wired-up services sharing one store and one invalidation channel
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<SqliteLedgerStore>,
    pub invalidator: Arc<BroadcastCacheInvalidator>,
    pub engine: AccrualEngine,
    pub ledger_service: LedgerService,
}

/// Open the database and construct the services described by `config`
pub async fn initialize_backend(config: &EngineConfig) -> Result<Backend> {
    info!("Setting up database");
    if let Some(parent) = config.database_path().as_deref().and_then(|path| path.parent()) {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let db = DbConnection::connect(&config.database_url, config.max_db_connections).await?;
    let store = Arc::new(SqliteLedgerStore::new(db));

    info!("Setting up domain services");
    let invalidator = Arc::new(BroadcastCacheInvalidator::new(INVALIDATION_CHANNEL_CAPACITY));
    let engine = AccrualEngine::new(store.clone(), invalidator.clone(), config.engine_settings()?);
    let ledger_service = LedgerService::new(store.clone(), invalidator.clone());

    Ok(Backend {
        store,
        invalidator,
        engine,
        ledger_service,
    })
}
