//! Sequential transaction executor.
//!
//! Signs and broadcasts batches of quote-supplied transactions with a cached
//! monotonic nonce. The executor is single-writer: one batch owns the signer
//! at a time, enforced by an internal mutex, and every other component that
//! needs a signed transaction (custody, vault) routes through [`CallSender`]
//! so the nonce sequence stays gap-free.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, Bytes, U256};
use alloy_rpc_types_eth::TransactionRequest;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, instrument};

use crate::chain::{ChainOps, NonceSource, TxConfirmation};
use crate::error::EngineError;
use crate::retry::{is_nonce_error, retry};
use crate::types::{TransactionPlan, format_units, parse_quantity};

const NONCE_MAX_RETRIES: u32 = 3;
const NONCE_BASE_DELAY: Duration = Duration::from_secs(2);
const NONCE_CACHE_WINDOW: Duration = Duration::from_secs(5);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of a completed batch: the hash of the last transaction plus the
/// cumulative gas accounting across every transaction in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub final_tx_hash: String,
    pub gas_used: u64,
    /// Total cost in ETH, decimal string.
    pub gas_cost_eth: String,
}

/// Result of a single mediated contract call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCall {
    pub tx_hash: String,
}

/// Batch execution of quote-supplied transactions.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute_batch(
        &self,
        tag: &str,
        txs: &[TransactionPlan],
    ) -> Result<BatchOutcome, EngineError>;
}

/// Single mediated contract calls (approvals, transfers, vault deposits).
/// Implemented on the same executor so every signature goes through the one
/// nonce sequence.
#[async_trait]
pub trait CallSender: Send + Sync {
    async fn send_call(
        &self,
        tag: &str,
        to: Address,
        calldata: Bytes,
    ) -> Result<SentCall, EngineError>;
}

#[derive(Debug, Clone, Copy)]
struct NonceEntry {
    current: u64,
    updated_at: Instant,
}

/// Per-address nonce cache with a freshness window.
///
/// Within the window the nonce increments locally; outside it (or after a
/// reset, or with `force_refresh`) the next call queries the chain at the
/// `pending` tag so mempool transactions are accounted for.
#[derive(Debug, Clone, Default)]
pub struct NonceManager {
    entries: Arc<DashMap<Address, NonceEntry>>,
    window: Duration,
}

impl NonceManager {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            window,
        }
    }

    /// Allocate the next nonce for `address`.
    pub async fn next<S: NonceSource + ?Sized>(
        &self,
        source: &S,
        address: Address,
        force_refresh: bool,
    ) -> Result<u64, EngineError> {
        if !force_refresh {
            if let Some(mut entry) = self.entries.get_mut(&address) {
                if entry.updated_at.elapsed() < self.window {
                    entry.current += 1;
                    return Ok(entry.current);
                }
            }
        }
        let fresh = source.pending_nonce(address).await?;
        self.entries.insert(
            address,
            NonceEntry {
                current: fresh,
                updated_at: Instant::now(),
            },
        );
        Ok(fresh)
    }

    /// Drop the cached nonce so the next allocation queries the chain.
    pub fn reset(&self, address: Address) {
        self.entries.remove(&address);
    }
}

/// Fields of a [`TransactionPlan`] after validation.
#[derive(Debug, Clone)]
struct PreparedTx {
    to: Address,
    data: Bytes,
    value: U256,
    gas: Option<u64>,
    gas_price: Option<u128>,
    max_fee_per_gas: Option<u128>,
    max_priority_fee_per_gas: Option<u128>,
}

/// Gas estimate with the 20% safety buffer applied.
fn buffered_gas(estimate: u64) -> u64 {
    estimate.saturating_add(estimate / 5)
}

fn parse_u64_quantity(s: &str) -> Result<u64, EngineError> {
    let value = parse_quantity(s)?;
    u64::try_from(value).map_err(|_| EngineError::Validation(format!("quantity {s} exceeds u64")))
}

fn parse_u128_quantity(s: &str) -> Result<u128, EngineError> {
    let value = parse_quantity(s)?;
    u128::try_from(value).map_err(|_| EngineError::Validation(format!("quantity {s} exceeds u128")))
}

/// Validate one quote-supplied transaction against the executor's chain.
fn prepare_transaction(plan: &TransactionPlan, chain_id: u64) -> Result<PreparedTx, EngineError> {
    if plan.chain_id != chain_id {
        return Err(EngineError::Validation(format!(
            "unsupported chain id {}, executor is bound to {chain_id}",
            plan.chain_id
        )));
    }
    let to: Address = plan
        .to
        .parse()
        .map_err(|e| EngineError::Validation(format!("invalid to address {}: {e}", plan.to)))?;
    let data: Bytes = if plan.data.is_empty() {
        Bytes::new()
    } else {
        plan.data
            .parse()
            .map_err(|e| EngineError::Validation(format!("invalid calldata: {e}")))?
    };
    let value = plan
        .value
        .as_deref()
        .map(parse_quantity)
        .transpose()?
        .unwrap_or(U256::ZERO);
    Ok(PreparedTx {
        to,
        data,
        value,
        gas: plan.gas.as_deref().map(parse_u64_quantity).transpose()?,
        gas_price: plan
            .gas_price
            .as_deref()
            .map(parse_u128_quantity)
            .transpose()?,
        max_fee_per_gas: plan
            .max_fee_per_gas
            .as_deref()
            .map(parse_u128_quantity)
            .transpose()?,
        max_priority_fee_per_gas: plan
            .max_priority_fee_per_gas
            .as_deref()
            .map(parse_u128_quantity)
            .transpose()?,
    })
}

/// The single-writer signer/broadcaster bound to one executor key.
pub struct TransactionExecutor {
    chain: Arc<dyn ChainOps>,
    executor_address: Address,
    chain_id: u64,
    nonces: NonceManager,
    receipt_timeout: Duration,
    batch_lock: tokio::sync::Mutex<()>,
}

impl TransactionExecutor {
    pub fn new(chain: Arc<dyn ChainOps>, executor_address: Address, chain_id: u64) -> Self {
        Self {
            chain,
            executor_address,
            chain_id,
            nonces: NonceManager::new(NONCE_CACHE_WINDOW),
            receipt_timeout: RECEIPT_TIMEOUT,
            batch_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[cfg(test)]
    fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn executor_address(&self) -> Address {
        self.executor_address
    }

    /// Send one prepared transaction, retrying nonce collisions with a cache
    /// reset between attempts so the retry picks up a fresh pending nonce.
    async fn submit_one(
        &self,
        tag: &str,
        index: usize,
        tx: &PreparedTx,
    ) -> Result<TxConfirmation, EngineError> {
        let nonces = &self.nonces;
        let executor_address = self.executor_address;
        retry(
            "send_transaction",
            NONCE_MAX_RETRIES,
            NONCE_BASE_DELAY,
            |e: &EngineError| {
                let retryable = is_nonce_error(&e.to_string());
                if retryable {
                    nonces.reset(executor_address);
                }
                retryable
            },
            move || async move {
                let mut txr = TransactionRequest::default()
                    .with_from(self.executor_address)
                    .with_to(tx.to)
                    .with_input(tx.data.clone());
                if tx.value > U256::ZERO {
                    txr.set_value(tx.value);
                }
                let gas_limit = match tx.gas {
                    Some(gas) => gas,
                    None => buffered_gas(self.chain.estimate_gas(&txr).await?),
                };
                txr.set_gas_limit(gas_limit);
                let nonce = self
                    .nonces
                    .next(&*self.chain, self.executor_address, false)
                    .await?;
                txr.set_nonce(nonce);
                if let (Some(max_fee), Some(priority)) =
                    (tx.max_fee_per_gas, tx.max_priority_fee_per_gas)
                {
                    txr.set_max_fee_per_gas(max_fee);
                    txr.set_max_priority_fee_per_gas(priority);
                } else if let Some(gas_price) = tx.gas_price {
                    txr.set_gas_price(gas_price);
                }
                let confirmation = self.chain.send_and_wait(txr, self.receipt_timeout).await?;
                if !confirmation.success {
                    let context = format!(
                        "transaction {} of {tag} reverted in {}",
                        index + 1,
                        confirmation.tx_hash
                    );
                    return Err(EngineError::Reverted(match &confirmation.revert_reason {
                        Some(reason) => format!("{context}: {reason}"),
                        None => context,
                    }));
                }
                Ok(confirmation)
            },
        )
        .await
    }

    async fn run_batch(
        &self,
        tag: &str,
        txs: &[TransactionPlan],
    ) -> Result<BatchOutcome, EngineError> {
        let mut total_gas: u64 = 0;
        let mut total_cost_wei = U256::ZERO;
        let mut final_tx_hash = None;
        for (index, plan) in txs.iter().enumerate() {
            let prepared = prepare_transaction(plan, self.chain_id)?;
            if prepared.value > U256::ZERO {
                let balance = self.chain.eth_balance(self.executor_address).await?;
                if balance < prepared.value {
                    return Err(EngineError::InsufficientEth {
                        balance,
                        required: prepared.value,
                    });
                }
            }
            let confirmation = self.submit_one(tag, index, &prepared).await?;
            total_gas += confirmation.gas_used;
            let price = if confirmation.effective_gas_price > 0 {
                confirmation.effective_gas_price
            } else {
                prepared.gas_price.unwrap_or(0)
            };
            total_cost_wei += U256::from(confirmation.gas_used) * U256::from(price);
            final_tx_hash = Some(confirmation.tx_hash);
        }
        let final_tx_hash = final_tx_hash
            .ok_or_else(|| EngineError::Validation(format!("empty transaction batch for {tag}")))?;
        info!(
            batch = tag,
            transactions = txs.len(),
            gas_used = total_gas,
            "batch confirmed"
        );
        Ok(BatchOutcome {
            final_tx_hash: final_tx_hash.to_string(),
            gas_used: total_gas,
            gas_cost_eth: format_units(total_cost_wei, 18),
        })
    }
}

#[async_trait]
impl BatchExecutor for TransactionExecutor {
    /// Execute a batch under the single-writer lock.
    ///
    /// The nonce cache is reset on entry (fresh network nonce per batch) and
    /// again on failure so the next batch cannot inherit a poisoned counter.
    #[instrument(skip(self, txs), fields(batch = tag, len = txs.len()), err)]
    async fn execute_batch(
        &self,
        tag: &str,
        txs: &[TransactionPlan],
    ) -> Result<BatchOutcome, EngineError> {
        let _guard = self.batch_lock.lock().await;
        self.nonces.reset(self.executor_address);
        let result = self.run_batch(tag, txs).await;
        if result.is_err() {
            self.nonces.reset(self.executor_address);
        }
        result
    }
}

#[async_trait]
impl CallSender for TransactionExecutor {
    async fn send_call(
        &self,
        tag: &str,
        to: Address,
        calldata: Bytes,
    ) -> Result<SentCall, EngineError> {
        let plan = TransactionPlan {
            chain_id: self.chain_id,
            to: to.to_string(),
            data: calldata.to_string(),
            value: None,
            gas: None,
            gas_price: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        };
        let outcome = self.execute_batch(tag, std::slice::from_ref(&plan)).await?;
        Ok(SentCall {
            tx_hash: outcome.final_tx_hash,
        })
    }
}
