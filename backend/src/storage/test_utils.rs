//! Test utilities providing a throwaway SQLite ledger per test.
//!
//! The database file lives in a temporary directory that is removed when the
//! environment is dropped, even if the test panics.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::TransactionType;
use std::sync::Arc;
use tempfile::TempDir;

use super::sqlite::ledger_repository::format_timestamp;
use super::sqlite::{DbConnection, SqliteLedgerStore};
use super::traits::LedgerStore;
use crate::domain::models::{AllowanceConfig, ChildLedger, Family, MarkerField, NewTransaction};

/// RAII test environment around a file-backed SQLite store
pub struct TestEnvironment {
    /// Kept alive until drop
    _temp_dir: TempDir,
    pub store: Arc<SqliteLedgerStore>,
}

impl TestEnvironment {
    pub async fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("ledger.db");
        let db = DbConnection::open_file(&db_path, 5).await?;

        Ok(TestEnvironment {
            _temp_dir: temp_dir,
            store: Arc::new(SqliteLedgerStore::new(db)),
        })
    }

    pub async fn family_with_child(&self, child_name: &str) -> Result<(Family, ChildLedger)> {
        let family = self.store.create_family("Test Family").await?;
        let child = self.store.create_child(&family.id, child_name).await?;
        Ok((family, child))
    }

    /// Seed a balance through a manual deposit so the ledger stays consistent
    pub async fn deposit(&self, child: &ChildLedger, amount: Decimal) -> Result<()> {
        let transaction = NewTransaction::manual(TransactionType::Deposit, amount, Utc::now(), "Opening balance");
        self.store
            .append_transaction(&child.family_id, &child.id, &transaction)
            .await
    }

    pub async fn configure(
        &self,
        child: &ChildLedger,
        allowance: Option<AllowanceConfig>,
        weekly_rate: Option<Decimal>,
    ) -> Result<()> {
        self.store
            .update_allowance_config(&child.family_id, &child.id, allowance.as_ref())
            .await?;
        self.store
            .set_weekly_interest_rate(&child.family_id, &child.id, weekly_rate)
            .await
    }

    /// Overwrite a marker directly, bypassing the guarded append
    pub async fn set_marker(&self, child_id: &str, marker: MarkerField, value: Option<DateTime<Utc>>) -> Result<()> {
        let sql = format!("UPDATE children SET {} = ? WHERE id = ?", marker.column());
        sqlx::query(&sql)
            .bind(value.map(format_timestamp))
            .bind(child_id)
            .execute(self.store.connection().pool())
            .await?;
        Ok(())
    }

    pub async fn reload(&self, child: &ChildLedger) -> Result<ChildLedger> {
        self.store
            .get_child(&child.family_id, &child.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("child {} disappeared", child.id))
    }
}
