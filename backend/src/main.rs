use anyhow::Result;
use chrono::Utc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use family_bank_backend::config::EngineConfig;
use family_bank_backend::domain::scheduler::{log_tick_report, run_tick_loop};
use family_bank_backend::initialize_backend;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("family_bank_backend=info,sqlx=warn")),
        )
        .init();

    let config = EngineConfig::load()?;
    let backend = initialize_backend(&config).await?;

    if config.run_once {
        info!("Running a single accrual tick");
        let report = backend.engine.run_tick(Utc::now()).await;
        log_tick_report(&report);
    } else {
        let shutdown = async {
            if let Err(cause) = tokio::signal::ctrl_c().await {
                tracing::error!(cause = %cause, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        let ticks = run_tick_loop(backend.engine.clone(), config.tick_interval(), shutdown).await;
        info!(ticks, "Accrual engine stopped");
    }

    backend.store.connection().close().await;
    Ok(())
}
