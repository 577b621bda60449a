use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use shared::{AllowancePeriod, TransactionSource, TransactionType};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;
use tracing::{debug, info};

use super::connection::DbConnection;
use crate::domain::models::{AllowanceConfig, ChildLedger, Family, LedgerTransaction, MarkerField, NewTransaction};
use crate::domain::money::{from_minor_units, to_minor_units};
use crate::storage::error::StoreError;
use crate::storage::traits::{AppendOutcome, LedgerStore};

const CHILD_COLUMNS: &str = "id, family_id, name, balance_cents, cash_box_balance_cents, \
     allowance_amount_cents, allowance_period, allowance_day, allowance_time, allowance_active, \
     weekly_interest_rate, last_allowance_payment, last_interest_calculation, created_at, updated_at";

/// Fixed-width UTC text so stored markers compare byte-for-byte
pub(crate) fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid stored timestamp '{}'", value))?
        .with_timezone(&Utc))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// SQLite-backed ledger documents
#[derive(Clone)]
pub struct SqliteLedgerStore {
    db: DbConnection,
}

impl SqliteLedgerStore {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DbConnection {
        &self.db
    }

    pub async fn create_family(&self, name: &str) -> Result<Family> {
        let family = Family {
            id: Family::generate_id(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO families (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&family.id)
            .bind(&family.name)
            .bind(format_timestamp(family.created_at))
            .execute(self.db.pool())
            .await?;

        info!(family_id = %family.id, "Created family");
        Ok(family)
    }

    /// New child with a zero balance and no recurring events configured
    pub async fn create_child(&self, family_id: &str, name: &str) -> Result<ChildLedger> {
        let now = Utc::now();
        let child = ChildLedger {
            id: ChildLedger::generate_id(),
            family_id: family_id.to_string(),
            name: name.to_string(),
            balance: Decimal::ZERO,
            cash_box_balance: Decimal::ZERO,
            allowance_config: None,
            weekly_interest_rate_percent: None,
            last_allowance_payment: None,
            last_interest_calculation: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO children (id, family_id, name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&child.id)
        .bind(&child.family_id)
        .bind(&child.name)
        .bind(format_timestamp(now))
        .bind(format_timestamp(now))
        .execute(self.db.pool())
        .await?;

        info!(family_id, child_id = %child.id, "Created child ledger");
        Ok(child)
    }

    /// Replace (or clear) the allowance schedule.
    ///
    /// Stored as given; schedule validity is checked when the engine reads it.
    pub async fn update_allowance_config(
        &self,
        family_id: &str,
        child_id: &str,
        config: Option<&AllowanceConfig>,
    ) -> Result<()> {
        let amount_cents = config
            .map(|c| to_minor_units(c.amount))
            .transpose()
            .map_err(StoreError::from)?;

        let result = sqlx::query(
            r#"
            UPDATE children
            SET allowance_amount_cents = ?, allowance_period = ?, allowance_day = ?,
                allowance_time = ?, allowance_active = ?, updated_at = ?
            WHERE id = ? AND family_id = ?
            "#,
        )
        .bind(amount_cents)
        .bind(config.map(|c| c.period.as_str()))
        .bind(config.map(|c| i64::from(c.day_of_period)))
        .bind(config.map(|c| c.time_of_day.clone()))
        .bind(config.map(|c| c.is_active).unwrap_or(false))
        .bind(format_timestamp(Utc::now()))
        .bind(child_id)
        .bind(family_id)
        .execute(self.db.pool())
        .await?;

        ensure_found(result.rows_affected(), family_id, child_id)
    }

    pub async fn set_weekly_interest_rate(&self, family_id: &str, child_id: &str, rate: Option<Decimal>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE children SET weekly_interest_rate = ?, updated_at = ? WHERE id = ? AND family_id = ?",
        )
        .bind(rate.map(|r| r.to_string()))
        .bind(format_timestamp(Utc::now()))
        .bind(child_id)
        .bind(family_id)
        .execute(self.db.pool())
        .await?;

        ensure_found(result.rows_affected(), family_id, child_id)
    }

    /// Archived children keep their ledger but are no longer processed
    pub async fn archive_child(&self, family_id: &str, child_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE children SET archived = 1, updated_at = ? WHERE id = ? AND family_id = ?")
            .bind(format_timestamp(Utc::now()))
            .bind(child_id)
            .bind(family_id)
            .execute(self.db.pool())
            .await?;

        ensure_found(result.rows_affected(), family_id, child_id)
    }

    fn row_to_child(row: &SqliteRow) -> Result<ChildLedger> {
        let allowance_config = match (
            row.try_get::<Option<i64>, _>("allowance_amount_cents")?,
            row.try_get::<Option<String>, _>("allowance_period")?,
            row.try_get::<Option<i64>, _>("allowance_day")?,
            row.try_get::<Option<String>, _>("allowance_time")?,
        ) {
            (Some(amount_cents), Some(period), Some(day), Some(time_of_day)) => Some(AllowanceConfig {
                amount: from_minor_units(amount_cents),
                period: AllowancePeriod::from_str(&period)?,
                // Out-of-range values surface later as an invalid schedule
                day_of_period: u32::try_from(day).unwrap_or(u32::MAX),
                time_of_day,
                is_active: row.try_get("allowance_active")?,
            }),
            _ => None,
        };

        let weekly_interest_rate_percent = row
            .try_get::<Option<String>, _>("weekly_interest_rate")?
            .map(|rate| Decimal::from_str(&rate))
            .transpose()
            .context("invalid stored interest rate")?;

        Ok(ChildLedger {
            id: row.try_get("id")?,
            family_id: row.try_get("family_id")?,
            name: row.try_get("name")?,
            balance: from_minor_units(row.try_get("balance_cents")?),
            cash_box_balance: from_minor_units(row.try_get("cash_box_balance_cents")?),
            allowance_config,
            weekly_interest_rate_percent,
            last_allowance_payment: parse_optional_timestamp(row.try_get("last_allowance_payment")?)?,
            last_interest_calculation: parse_optional_timestamp(row.try_get("last_interest_calculation")?)?,
            created_at: parse_timestamp(row.try_get::<&str, _>("created_at")?)?,
            updated_at: parse_timestamp(row.try_get::<&str, _>("updated_at")?)?,
        })
    }

    fn row_to_transaction(row: &SqliteRow) -> Result<LedgerTransaction> {
        Ok(LedgerTransaction {
            id: row.try_get("id")?,
            family_id: row.try_get("family_id")?,
            child_id: row.try_get("child_id")?,
            transaction_type: TransactionType::from_str(row.try_get::<&str, _>("transaction_type")?)?,
            amount: from_minor_units(row.try_get("amount_cents")?),
            timestamp: parse_timestamp(row.try_get::<&str, _>("timestamp")?)?,
            source: TransactionSource::from_str(row.try_get::<&str, _>("source")?)?,
            description: row.try_get("description")?,
            created_at: parse_timestamp(row.try_get::<&str, _>("created_at")?)?,
        })
    }
}

fn ensure_found(rows_affected: u64, family_id: &str, child_id: &str) -> Result<()> {
    if rows_affected == 0 {
        return Err(StoreError::ChildNotFound {
            family_id: family_id.to_string(),
            child_id: child_id.to_string(),
        }
        .into());
    }
    Ok(())
}

async fn child_exists(conn: &mut SqliteConnection, family_id: &str, child_id: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM children WHERE id = ? AND family_id = ?")
        .bind(child_id)
        .bind(family_id)
        .fetch_optional(conn)
        .await?;
    Ok(found.is_some())
}

async fn insert_transaction(
    conn: &mut SqliteConnection,
    family_id: &str,
    child_id: &str,
    transaction: &NewTransaction,
) -> Result<()> {
    let amount_cents = to_minor_units(transaction.amount()).map_err(StoreError::from)?;

    sqlx::query(
        r#"
        INSERT INTO transactions (id, family_id, child_id, transaction_type, amount_cents, source, description, timestamp, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(transaction.id())
    .bind(family_id)
    .bind(child_id)
    .bind(transaction.transaction_type().as_str())
    .bind(amount_cents)
    .bind(transaction.source().as_str())
    .bind(transaction.description())
    .bind(format_timestamp(transaction.timestamp()))
    .bind(format_timestamp(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

fn check_provenance(transaction: &NewTransaction, expected: TransactionSource) -> Result<()> {
    if !transaction.has_consistent_provenance() || transaction.source() != expected {
        return Err(StoreError::ProvenanceMismatch {
            id: transaction.id().to_string(),
            expected: expected.as_str(),
        }
        .into());
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn list_families(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM families ORDER BY created_at, id")
            .fetch_all(self.db.pool())
            .await?;
        Ok(ids)
    }

    async fn list_children(&self, family_id: &str) -> Result<Vec<ChildLedger>> {
        let sql = format!(
            "SELECT {} FROM children WHERE family_id = ? AND archived = 0 ORDER BY name, id",
            CHILD_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(family_id).fetch_all(self.db.pool()).await?;
        rows.iter().map(Self::row_to_child).collect()
    }

    async fn get_child(&self, family_id: &str, child_id: &str) -> Result<Option<ChildLedger>> {
        let sql = format!("SELECT {} FROM children WHERE id = ? AND family_id = ?", CHILD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(child_id)
            .bind(family_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(Self::row_to_child).transpose()
    }

    async fn append_transaction_if_marker_unchanged(
        &self,
        family_id: &str,
        child_id: &str,
        transaction: Option<&NewTransaction>,
        marker: MarkerField,
        expected_old_marker: Option<DateTime<Utc>>,
        new_marker: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let delta_cents = match transaction {
            Some(transaction) => {
                check_provenance(transaction, marker.event().source())?;
                to_minor_units(transaction.signed_amount()).map_err(StoreError::from)?
            }
            None => 0,
        };

        let mut tx = self.db.pool().begin().await?;

        // The guarded UPDATE is the first statement, so the write lock is
        // taken before the marker is read.
        let sql = format!(
            "UPDATE children SET balance_cents = balance_cents + ?, {column} = ?, updated_at = ? \
             WHERE id = ? AND family_id = ? AND {column} IS ?",
            column = marker.column()
        );
        let result = sqlx::query(&sql)
            .bind(delta_cents)
            .bind(format_timestamp(new_marker))
            .bind(format_timestamp(Utc::now()))
            .bind(child_id)
            .bind(family_id)
            .bind(expected_old_marker.map(format_timestamp))
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            let exists = child_exists(&mut tx, family_id, child_id).await?;
            tx.rollback().await?;
            if !exists {
                return Err(StoreError::ChildNotFound {
                    family_id: family_id.to_string(),
                    child_id: child_id.to_string(),
                }
                .into());
            }
            debug!(family_id, child_id, marker = marker.column(), "Marker changed since snapshot");
            return Ok(AppendOutcome::Conflict);
        }

        if let Some(transaction) = transaction {
            insert_transaction(&mut tx, family_id, child_id, transaction).await?;
        }
        tx.commit().await?;

        Ok(AppendOutcome::Applied)
    }

    async fn append_transaction(&self, family_id: &str, child_id: &str, transaction: &NewTransaction) -> Result<()> {
        check_provenance(transaction, TransactionSource::Manual)?;
        let delta_cents = to_minor_units(transaction.signed_amount()).map_err(StoreError::from)?;

        let mut tx = self.db.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE children SET balance_cents = balance_cents + ?, updated_at = ? WHERE id = ? AND family_id = ?",
        )
        .bind(delta_cents)
        .bind(format_timestamp(Utc::now()))
        .bind(child_id)
        .bind(family_id)
        .execute(&mut *tx)
        .await?;
        ensure_found(result.rows_affected(), family_id, child_id)?;

        insert_transaction(&mut tx, family_id, child_id, transaction).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_transactions(
        &self,
        family_id: &str,
        child_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<LedgerTransaction>> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT id, family_id, child_id, transaction_type, amount_cents, source, description, timestamp, created_at
            FROM transactions
            WHERE family_id = ? AND child_id = ?
            ORDER BY created_at DESC, ROWID DESC
            LIMIT ?
            "#,
        )
        .bind(family_id)
        .bind(child_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::row_to_transaction).collect()
    }
}
