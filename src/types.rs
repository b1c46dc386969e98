//! Domain types shared across the engine.
//!
//! Amounts cross three representations: human-unit decimal strings as stored
//! on plans (`"100"`, `"0.03"`), atomic token units as [`U256`], and display
//! strings written back into the audit history. Conversion always goes through
//! [`parse_units`] / [`format_units`] at the token's declared decimals; no
//! floating point is involved anywhere amounts are persisted.

use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Minutes in a week, used to derive the total execution count of a plan.
pub const MINUTES_PER_WEEK: i64 = 10_080;

/// Lifecycle state of a DCA plan. Stored uppercase in the plan store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Active => "ACTIVE",
            PlanStatus::Paused => "PAUSED",
            PlanStatus::Completed => "COMPLETED",
            PlanStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(PlanStatus::Active),
            "PAUSED" => Ok(PlanStatus::Paused),
            "COMPLETED" => Ok(PlanStatus::Completed),
            "CANCELLED" => Ok(PlanStatus::Cancelled),
            other => Err(format!("unknown plan status: {other}")),
        }
    }
}

/// Terminal state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failed,
    Pending,
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Pending => "PENDING",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "PENDING" => Ok(ExecutionStatus::Pending),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A standing instruction to convert `amount` of `from_token` into `to_token`
/// every `interval_minutes` until `total_executions` iterations have run.
///
/// Plans are created by the external CRUD surface; the engine only ever
/// advances `execution_count` / `next_execution_at` and flips `status` to
/// `COMPLETED`.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    pub user_address: Address,
    pub from_token: String,
    pub to_token: String,
    /// Human-unit decimal string, parsed at the source token's decimals.
    pub amount: String,
    pub interval_minutes: i64,
    pub duration_weeks: i64,
    pub slippage_percent: String,
    pub status: PlanStatus,
    pub execution_count: i64,
    pub total_executions: i64,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `floor(duration_weeks * 10080 / interval_minutes)`.
pub fn total_executions_for(duration_weeks: i64, interval_minutes: i64) -> i64 {
    duration_weeks * MINUTES_PER_WEEK / interval_minutes
}

/// One row of the append-only execution history.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: uuid::Uuid,
    pub plan_id: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub from_amount: String,
    pub to_amount: String,
    pub exchange_rate: String,
    pub gas_fee: Option<String>,
    pub tx_hash: Option<String>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub vault_address: Option<String>,
    pub share_tokens: Option<String>,
    pub deposit_tx_hash: Option<String>,
}

/// Payload for appending an execution row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub plan_id: Option<String>,
    pub from_amount: String,
    pub to_amount: String,
    pub exchange_rate: String,
    pub gas_fee: Option<String>,
    pub tx_hash: Option<String>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub vault_address: Option<String>,
    pub share_tokens: Option<String>,
    pub deposit_tx_hash: Option<String>,
}

impl NewExecution {
    /// A failed attempt: no transaction hash, no gas fee, the root error
    /// message preserved for the history surface.
    pub fn failure(plan_id: Option<String>, from_amount: String, error: &EngineError) -> Self {
        NewExecution {
            plan_id,
            from_amount,
            to_amount: "0".to_string(),
            exchange_rate: "0".to_string(),
            gas_fee: None,
            tx_hash: None,
            status: ExecutionStatus::Failed,
            error_message: Some(error.to_string()),
            vault_address: None,
            share_tokens: None,
            deposit_tx_hash: None,
        }
    }
}

/// Vault shares held by a user, tracked per `(user, vault)` pair.
#[derive(Debug, Clone)]
pub struct VaultHolding {
    pub user_address: String,
    pub vault_address: String,
    pub token_symbol: String,
    /// Decimal string at the vault's share decimals.
    pub share_tokens: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A token known to the registry: symbol plus the chain-specific deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDescriptor {
    pub symbol: String,
    pub chain_id: u64,
    pub address: Address,
    pub decimals: u8,
    pub name: String,
}

/// One atomic transaction of a swap plan, as returned by the quoting service.
///
/// Treated as an immutable input to the transaction executor, which validates
/// every field before signing. Quantity-like fields stay strings here because
/// quoting services emit both `0x`-hex and decimal forms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPlan {
    pub chain_id: u64,
    pub to: String,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<String>,
}

fn pow10(decimals: u8) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}

/// Parse a human-unit decimal string into atomic units at `decimals`.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] on empty/negative/non-numeric input or
/// when the fractional part is longer than the token's decimals.
pub fn parse_units(amount: &str, decimals: u8) -> Result<U256, EngineError> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(EngineError::Validation("empty amount".to_string()));
    }
    if amount.starts_with('-') {
        return Err(EngineError::Validation(format!(
            "negative amount: {amount}"
        )));
    }
    let (int_part, frac_part) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(EngineError::Validation(format!(
            "invalid decimal amount: {amount}"
        )));
    }
    if frac_part.len() > decimals as usize {
        return Err(EngineError::Validation(format!(
            "amount {amount} has more than {decimals} decimal places"
        )));
    }
    let int_value = U256::from_str_radix(int_part, 10)
        .map_err(|e| EngineError::Validation(format!("invalid amount {amount}: {e}")))?;
    let mut frac_value = U256::ZERO;
    if !frac_part.is_empty() {
        let padded = pow10(decimals - frac_part.len() as u8);
        frac_value = U256::from_str_radix(frac_part, 10)
            .map_err(|e| EngineError::Validation(format!("invalid amount {amount}: {e}")))?
            * padded;
    }
    int_value
        .checked_mul(pow10(decimals))
        .and_then(|v| v.checked_add(frac_value))
        .ok_or_else(|| EngineError::Validation(format!("amount {amount} overflows")))
}

/// Format atomic units back into a human-unit decimal string, trailing zeros
/// trimmed (`99000000000000000000` at 18 decimals renders as `"99"`).
pub fn format_units(value: U256, decimals: u8) -> String {
    if decimals == 0 {
        return value.to_string();
    }
    let divisor = pow10(decimals);
    let int_part = value / divisor;
    let frac_part = value % divisor;
    if frac_part.is_zero() {
        return int_part.to_string();
    }
    let frac = format!("{frac_part:0>width$}", width = decimals as usize);
    let frac = frac.trim_end_matches('0');
    format!("{int_part}.{frac}")
}

/// Parse a quantity that may be `0x`-hex or decimal.
pub fn parse_quantity(s: &str) -> Result<U256, EngineError> {
    let s = s.trim();
    let parsed = if let Some(hex_digits) = s.strip_prefix("0x") {
        U256::from_str_radix(hex_digits, 16)
    } else {
        U256::from_str_radix(s, 10)
    };
    parsed.map_err(|e| EngineError::Validation(format!("invalid quantity {s}: {e}")))
}
