//! Durable plan store.
//!
//! Postgres is the single source of truth for plans, the append-only
//! execution history, and vault holdings. The engine claims due plans with a
//! row-level lease (`FOR UPDATE SKIP LOCKED` + `leased_until`) so concurrent
//! scheduler processes cannot double-execute a plan, and advances plans with
//! row-scoped updates only.

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::instrument;
use url::Url;
use uuid::Uuid;

use crate::types::{
    Execution, ExecutionStatus, NewExecution, Plan, PlanStatus, VaultHolding, format_units,
    parse_units,
};

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    /// A persisted value failed to parse back into its domain type.
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("plan not found: {0}")]
    NotFound(String),
}

/// Storage operations the scheduler and pipeline depend on.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Claim every ACTIVE plan due at `now` (inclusive), stamping a lease so
    /// other scheduler processes skip them. Ordered by `next_execution_at`
    /// ascending.
    async fn claim_due_plans(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Plan>, StoreError>;

    async fn plan_by_id(&self, id: &str) -> Result<Option<Plan>, StoreError>;

    /// Drop the lease early so the next tick can pick the plan up again.
    async fn release_lease(&self, id: &str) -> Result<(), StoreError>;

    /// Append one row to the execution history.
    async fn record_execution(&self, new: NewExecution) -> Result<Execution, StoreError>;

    /// Advance a plan after a successful execution: increment the count and
    /// either schedule the next run or complete the plan.
    async fn advance_after_success(
        &self,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Plan, StoreError>;

    /// Credit `delta_shares` (atomic units at `share_decimals`) to the
    /// `(user, vault)` holding, using exact big-integer addition.
    async fn upsert_vault_holding(
        &self,
        user_address: &str,
        vault_address: &str,
        token_symbol: &str,
        delta_shares: U256,
        share_decimals: u8,
    ) -> Result<VaultHolding, StoreError>;

    async fn latest_execution(&self, plan_id: &str) -> Result<Option<Execution>, StoreError>;

    async fn count_active_plans(&self) -> Result<i64, StoreError>;
}

/// Add a share delta to a stored decimal string at the vault's decimals.
pub(crate) fn add_share_amounts(
    current: &str,
    delta: U256,
    decimals: u8,
) -> Result<String, StoreError> {
    let current_atomic = parse_units(current, decimals)
        .map_err(|e| StoreError::Corrupt(format!("share balance {current}: {e}")))?;
    let updated = current_atomic
        .checked_add(delta)
        .ok_or_else(|| StoreError::Corrupt(format!("share balance {current} overflows")))?;
    Ok(format_units(updated, decimals))
}

const PLAN_COLUMNS: &str = "id, user_address, from_token, to_token, amount, interval_minutes, \
     duration_weeks, slippage, status, next_execution_at, execution_count, total_executions, \
     created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, plan_id, executed_at, from_amount, to_amount, exchange_rate, \
     gas_fee, tx_hash, status, error_message, vault_address, share_tokens, deposit_tx_hash";

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: String,
    user_address: String,
    from_token: String,
    to_token: String,
    amount: String,
    interval_minutes: i64,
    duration_weeks: i64,
    slippage: String,
    status: String,
    next_execution_at: Option<DateTime<Utc>>,
    execution_count: i64,
    total_executions: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PlanRow> for Plan {
    type Error = StoreError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        let user_address = row
            .user_address
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("plan {} user address: {e}", row.id)))?;
        let status: PlanStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("plan {}: {e}", row.id)))?;
        Ok(Plan {
            id: row.id,
            user_address,
            from_token: row.from_token,
            to_token: row.to_token,
            amount: row.amount,
            interval_minutes: row.interval_minutes,
            duration_weeks: row.duration_weeks,
            slippage_percent: row.slippage,
            status,
            execution_count: row.execution_count,
            total_executions: row.total_executions,
            next_execution_at: row.next_execution_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    plan_id: Option<String>,
    executed_at: DateTime<Utc>,
    from_amount: String,
    to_amount: String,
    exchange_rate: String,
    gas_fee: Option<String>,
    tx_hash: Option<String>,
    status: String,
    error_message: Option<String>,
    vault_address: Option<String>,
    share_tokens: Option<String>,
    deposit_tx_hash: Option<String>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let status: ExecutionStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("execution {}: {e}", row.id)))?;
        Ok(Execution {
            id: row.id,
            plan_id: row.plan_id,
            executed_at: row.executed_at,
            from_amount: row.from_amount,
            to_amount: row.to_amount,
            exchange_rate: row.exchange_rate,
            gas_fee: row.gas_fee,
            tx_hash: row.tx_hash,
            status,
            error_message: row.error_message,
            vault_address: row.vault_address,
            share_tokens: row.share_tokens,
            deposit_tx_hash: row.deposit_tx_hash,
        })
    }
}

/// Postgres-backed [`PlanStore`].
#[derive(Debug, Clone)]
pub struct PgPlanStore {
    pool: PgPool,
}

impl PgPlanStore {
    /// Connect and run embedded migrations.
    pub async fn connect(database_url: &Url) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url.as_str())
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl PlanStore for PgPlanStore {
    #[instrument(skip(self), err)]
    async fn claim_due_plans(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Plan>, StoreError> {
        let leased_until = now + lease;
        let sql = format!(
            "WITH due AS ( \
                 SELECT id FROM plans \
                 WHERE status = 'ACTIVE' \
                   AND next_execution_at IS NOT NULL \
                   AND next_execution_at <= $1 \
                   AND (leased_until IS NULL OR leased_until <= $1) \
                 ORDER BY next_execution_at ASC \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE plans SET leased_until = $2 \
             WHERE id IN (SELECT id FROM due) \
             RETURNING {PLAN_COLUMNS}"
        );
        let rows: Vec<PlanRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(leased_until)
            .fetch_all(&self.pool)
            .await?;
        let mut plans = rows
            .into_iter()
            .map(Plan::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE ordering
        plans.sort_by_key(|p| p.next_execution_at);
        Ok(plans)
    }

    async fn plan_by_id(&self, id: &str) -> Result<Option<Plan>, StoreError> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1");
        let row: Option<PlanRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Plan::try_from).transpose()
    }

    async fn release_lease(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE plans SET leased_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, new), err, fields(plan = ?new.plan_id, status = %new.status))]
    async fn record_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let sql = format!(
            "INSERT INTO executions ({EXECUTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {EXECUTION_COLUMNS}"
        );
        let row: ExecutionRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.plan_id)
            .bind(Utc::now())
            .bind(&new.from_amount)
            .bind(&new.to_amount)
            .bind(&new.exchange_rate)
            .bind(&new.gas_fee)
            .bind(&new.tx_hash)
            .bind(new.status.to_string())
            .bind(&new.error_message)
            .bind(&new.vault_address)
            .bind(&new.share_tokens)
            .bind(&new.deposit_tx_hash)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    #[instrument(skip(self), err)]
    async fn advance_after_success(
        &self,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Plan, StoreError> {
        let sql = format!(
            "UPDATE plans \
             SET execution_count = execution_count + 1, \
                 status = CASE WHEN execution_count + 1 >= total_executions \
                               THEN 'COMPLETED' ELSE status END, \
                 next_execution_at = CASE WHEN execution_count + 1 >= total_executions \
                                          THEN NULL \
                                          ELSE $2 + make_interval(mins => interval_minutes::int) END, \
                 updated_at = $2, \
                 leased_until = NULL \
             WHERE id = $1 \
             RETURNING {PLAN_COLUMNS}"
        );
        let row: Option<PlanRow> = sqlx::query_as(&sql)
            .bind(plan_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| StoreError::NotFound(plan_id.to_string()))?
            .try_into()
    }

    #[instrument(skip(self), err)]
    async fn upsert_vault_holding(
        &self,
        user_address: &str,
        vault_address: &str,
        token_symbol: &str,
        delta_shares: U256,
        share_decimals: u8,
    ) -> Result<VaultHolding, StoreError> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT share_tokens FROM user_vault_holdings \
             WHERE user_address = $1 AND vault_address = $2 FOR UPDATE",
        )
        .bind(user_address)
        .bind(vault_address)
        .fetch_optional(&mut *tx)
        .await?;

        let row: (String, DateTime<Utc>, DateTime<Utc>) = match existing {
            Some((current,)) => {
                let updated = add_share_amounts(&current, delta_shares, share_decimals)?;
                sqlx::query_as(
                    "UPDATE user_vault_holdings \
                     SET share_tokens = $3, updated_at = now() \
                     WHERE user_address = $1 AND vault_address = $2 \
                     RETURNING share_tokens, created_at, updated_at",
                )
                .bind(user_address)
                .bind(vault_address)
                .bind(updated)
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                let fresh = format_units(delta_shares, share_decimals);
                sqlx::query_as(
                    "INSERT INTO user_vault_holdings \
                         (id, user_address, vault_address, share_tokens, token_symbol) \
                     VALUES ($1, $2, $3, $4, $5) \
                     RETURNING share_tokens, created_at, updated_at",
                )
                .bind(Uuid::new_v4())
                .bind(user_address)
                .bind(vault_address)
                .bind(fresh)
                .bind(token_symbol)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;
        Ok(VaultHolding {
            user_address: user_address.to_string(),
            vault_address: vault_address.to_string(),
            token_symbol: token_symbol.to_string(),
            share_tokens: row.0,
            created_at: row.1,
            updated_at: row.2,
        })
    }

    async fn latest_execution(&self, plan_id: &str) -> Result<Option<Execution>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE plan_id = $1 ORDER BY executed_at DESC LIMIT 1"
        );
        let row: Option<ExecutionRow> = sqlx::query_as(&sql)
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Execution::try_from).transpose()
    }

    async fn count_active_plans(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plans WHERE status = 'ACTIVE'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_addition_is_exact_at_vault_decimals() {
        // 10.0 shares plus 99.0 shares at 18 decimals
        let delta = U256::from_str_radix("99000000000000000000", 10).unwrap();
        assert_eq!(add_share_amounts("10.0", delta, 18).unwrap(), "109");
    }

    #[test]
    fn share_addition_keeps_sub_unit_precision() {
        let delta = U256::from(1u64);
        assert_eq!(
            add_share_amounts("0.000001", delta, 6).unwrap(),
            "0.000002"
        );
    }

    #[test]
    fn share_addition_rejects_corrupt_balances() {
        assert!(matches!(
            add_share_amounts("not a number", U256::from(1u64), 6),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn plan_row_conversion_validates_address_and_status() {
        let row = PlanRow {
            id: "P1".to_string(),
            user_address: "0x00000000000000000000000000000000000000a1".to_string(),
            from_token: "USDC".to_string(),
            to_token: "WETH".to_string(),
            amount: "100".to_string(),
            interval_minutes: 10_080,
            duration_weeks: 4,
            slippage: "2".to_string(),
            status: "ACTIVE".to_string(),
            next_execution_at: Some(Utc::now()),
            execution_count: 0,
            total_executions: 4,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let plan = Plan::try_from(row).unwrap();
        assert_eq!(plan.status, PlanStatus::Active);

        let bad = PlanRow {
            status: "RUNNING".to_string(),
            id: "P2".to_string(),
            user_address: "0x00000000000000000000000000000000000000a1".to_string(),
            from_token: "USDC".to_string(),
            to_token: "WETH".to_string(),
            amount: "100".to_string(),
            interval_minutes: 10_080,
            duration_weeks: 4,
            slippage: "2".to_string(),
            next_execution_at: None,
            execution_count: 0,
            total_executions: 4,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(matches!(Plan::try_from(bad), Err(StoreError::Corrupt(_))));
    }
}
