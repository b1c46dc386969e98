//! The swap pipeline: one DCA iteration end to end.
//!
//! Order matters and every step must succeed: resolve tokens, secure custody,
//! fetch a quote, broadcast the quote's transactions, measure what actually
//! arrived, optionally deposit the delta into a vault, then record the
//! execution and advance the plan. A failure at any step records a FAILED
//! execution (when a plan is attached), leaves the plan untouched, and
//! propagates.

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, instrument};

use crate::chain::ChainReads;
use crate::custody::CustodyManager;
use crate::error::EngineError;
use crate::executor::BatchExecutor;
use crate::quote::{CreateSwap, QuoteApi, normalize_slippage};
use crate::registry::TokenRegistry;
use crate::store::PlanStore;
use crate::types::{Execution, ExecutionStatus, NewExecution, Plan, parse_units};
use crate::vault::VaultRegistry;

/// Inputs for one swap, either derived from a plan or standalone.
#[derive(Debug, Clone)]
pub struct SwapRequest {
    pub plan_id: Option<String>,
    pub from_token: String,
    pub to_token: String,
    /// Human units of the source token.
    pub amount: String,
    pub user_address: Address,
    pub slippage_percent: String,
}

impl SwapRequest {
    pub fn from_plan(plan: &Plan) -> Self {
        SwapRequest {
            plan_id: Some(plan.id.clone()),
            from_token: plan.from_token.clone(),
            to_token: plan.to_token.clone(),
            amount: plan.amount.clone(),
            user_address: plan.user_address,
            slippage_percent: plan.slippage_percent.clone(),
        }
    }
}

/// Executes one plan iteration. The scheduler depends on this seam so plan
/// driving can be exercised without touching a chain.
#[async_trait]
pub trait PlanRunner: Send + Sync {
    async fn run_plan(&self, plan: &Plan) -> Result<Execution, EngineError>;
}

/// Orchestrates token resolution, custody, quoting, execution, vault
/// deposits, and audit recording for a single swap.
pub struct SwapPipeline {
    registry: Arc<TokenRegistry>,
    custody: CustodyManager,
    quote: Arc<dyn QuoteApi>,
    executor: Arc<dyn BatchExecutor>,
    chain: Arc<dyn ChainReads>,
    store: Arc<dyn PlanStore>,
    vaults: VaultRegistry,
    executor_address: Address,
    chain_id: u64,
}

impl SwapPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TokenRegistry>,
        custody: CustodyManager,
        quote: Arc<dyn QuoteApi>,
        executor: Arc<dyn BatchExecutor>,
        chain: Arc<dyn ChainReads>,
        store: Arc<dyn PlanStore>,
        vaults: VaultRegistry,
        executor_address: Address,
        chain_id: u64,
    ) -> Self {
        Self {
            registry,
            custody,
            quote,
            executor,
            chain,
            store,
            vaults,
            executor_address,
            chain_id,
        }
    }

    /// Run one swap. On failure a FAILED execution row is written when the
    /// request belongs to a plan; the plan itself is never advanced here.
    #[instrument(skip(self, request), err, fields(
        plan = ?request.plan_id,
        from = %request.from_token,
        to = %request.to_token,
        amount = %request.amount,
    ))]
    pub async fn execute(&self, request: SwapRequest) -> Result<Execution, EngineError> {
        match self.run(&request).await {
            Ok(execution) => Ok(execution),
            Err(error) => {
                if request.plan_id.is_some() {
                    let failure = NewExecution::failure(
                        request.plan_id.clone(),
                        request.amount.clone(),
                        &error,
                    );
                    if let Err(store_error) = self.store.record_execution(failure).await {
                        error!(
                            plan = ?request.plan_id,
                            error = %store_error,
                            "failed to record failed execution"
                        );
                    }
                }
                Err(error)
            }
        }
    }

    async fn run(&self, request: &SwapRequest) -> Result<Execution, EngineError> {
        // 1. Token resolution, pinned to the execution chain.
        let from = self
            .registry
            .resolve(&request.from_token, self.chain_id)
            .await?;
        let to = self
            .registry
            .resolve(&request.to_token, self.chain_id)
            .await?;
        let atomic_amount = parse_units(&request.amount, from.decimals)?;

        // 2. Custody: executor must hold the amount and the router must be
        //    able to pull it.
        self.custody
            .ensure(&from, atomic_amount, request.user_address)
            .await?;

        // 3. Quote. The recipient is always the end user.
        let slippage = normalize_slippage(&request.slippage_percent)?;
        let swap = self
            .quote
            .create_swap(&CreateSwap {
                chain_id: self.chain_id,
                base_token: from.address,
                quote_token: to.address,
                amount: atomic_amount.to_string(),
                recipient: request.user_address,
                slippage_tolerance: slippage,
            })
            .await?;
        if swap.transactions.is_empty() {
            return Err(EngineError::QuoteUnavailable(
                "quoting service returned no transactions".to_string(),
            ));
        }

        // 4. Pre-measure the executor's destination balance when the swap
        //    feeds a vault.
        let vault = self.vaults.for_token(&to.symbol);
        let balance_before = match vault {
            Some(_) => Some(
                self.chain
                    .erc20_balance(to.address, self.executor_address)
                    .await?,
            ),
            None => None,
        };

        // 5. Broadcast.
        let tag = request.plan_id.as_deref().unwrap_or("standalone");
        let outcome = self.executor.execute_batch(tag, &swap.transactions).await?;

        // 6. Post-measure and deposit the exact received delta.
        let mut vault_address = None;
        let mut share_tokens = None;
        let mut deposit_tx_hash = None;
        if let (Some(target), Some(before)) = (vault, balance_before) {
            let after = self
                .chain
                .erc20_balance(to.address, self.executor_address)
                .await?;
            let received = after.saturating_sub(before);
            if received > U256::ZERO {
                let deposit = target
                    .adapter
                    .deposit(to.address, target.address, received, request.user_address)
                    .await?;
                self.store
                    .upsert_vault_holding(
                        &request.user_address.to_string(),
                        &target.address.to_string(),
                        &to.symbol,
                        deposit.shares_atomic,
                        deposit.share_decimals,
                    )
                    .await?;
                vault_address = Some(target.address.to_string());
                share_tokens = Some(deposit.share_tokens);
                deposit_tx_hash = Some(deposit.deposit_tx_hash);
            }
        }

        // 7. Record the audit row, then advance the plan.
        let execution = self
            .store
            .record_execution(NewExecution {
                plan_id: request.plan_id.clone(),
                from_amount: swap
                    .display_from_amount
                    .clone()
                    .unwrap_or_else(|| request.amount.clone()),
                to_amount: swap.display_to_amount.clone(),
                exchange_rate: swap.effective_price.clone(),
                gas_fee: Some(outcome.gas_cost_eth.clone()),
                tx_hash: Some(outcome.final_tx_hash.clone()),
                status: ExecutionStatus::Success,
                error_message: None,
                vault_address,
                share_tokens,
                deposit_tx_hash,
            })
            .await?;
        if let Some(plan_id) = &request.plan_id {
            self.store.advance_after_success(plan_id, Utc::now()).await?;
        }
        info!(
            tx = %outcome.final_tx_hash,
            gas_eth = %outcome.gas_cost_eth,
            "swap executed"
        );
        Ok(execution)
    }
}

#[async_trait]
impl PlanRunner for SwapPipeline {
    async fn run_plan(&self, plan: &Plan) -> Result<Execution, EngineError> {
        self.execute(SwapRequest::from_plan(plan)).await
    }
}
