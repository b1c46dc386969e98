//! In-memory fakes shared across unit tests.
//!
//! `MemoryPlanStore` mirrors the Postgres store's claim/advance/lease
//! semantics so scheduler and pipeline behavior can be exercised without a
//! database; the chain/quote/executor fakes record every interaction for
//! assertions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use alloy_primitives::{Address, B256, Bytes, U256, address};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::chain::{ChainReads, NonceSource, TxConfirmation, TxSubmitter};
use crate::error::EngineError;
use crate::executor::{BatchExecutor, BatchOutcome, CallSender, SentCall};
use crate::pipeline::PlanRunner;
use crate::quote::{CreateSwap, QuoteApi, SwapPlan};
use crate::store::{PlanStore, StoreError, add_share_amounts};
use crate::types::{
    Execution, ExecutionStatus, NewExecution, Plan, PlanStatus, TokenDescriptor, TransactionPlan,
    VaultHolding, format_units,
};

pub fn usdc() -> TokenDescriptor {
    TokenDescriptor {
        symbol: "USDC".to_string(),
        chain_id: 42161,
        address: address!("0xaf88d065e77c8cC2239327C5EDb3A432268e5831"),
        decimals: 6,
        name: "USD Coin".to_string(),
    }
}

pub fn weth() -> TokenDescriptor {
    TokenDescriptor {
        symbol: "WETH".to_string(),
        chain_id: 42161,
        address: address!("0x82aF49447D8a07e3bd95BD0d56f35241523fBab1"),
        decimals: 18,
        name: "Wrapped Ether".to_string(),
    }
}

/// A weekly 100-USDC-into-WETH plan over four weeks.
pub fn plan_fixture(id: &str, user: Address, next_execution_at: DateTime<Utc>) -> Plan {
    Plan {
        id: id.to_string(),
        user_address: user,
        from_token: "USDC".to_string(),
        to_token: "WETH".to_string(),
        amount: "100".to_string(),
        interval_minutes: 10_080,
        duration_weeks: 4,
        slippage_percent: "2".to_string(),
        status: PlanStatus::Active,
        execution_count: 0,
        total_executions: 4,
        next_execution_at: Some(next_execution_at),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn execution_fixture(plan_id: Option<String>) -> Execution {
    Execution {
        id: uuid::Uuid::new_v4(),
        plan_id,
        executed_at: Utc::now(),
        from_amount: "100".to_string(),
        to_amount: "0.03".to_string(),
        exchange_rate: "3333.33".to_string(),
        gas_fee: Some("0.001".to_string()),
        tx_hash: Some("0xabc".to_string()),
        status: ExecutionStatus::Success,
        error_message: None,
        vault_address: None,
        share_tokens: None,
        deposit_tx_hash: None,
    }
}

/// Snapshot of one transaction request handed to the fake chain.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub to: Option<Address>,
    pub nonce: Option<u64>,
    pub gas: Option<u64>,
    pub value: Option<U256>,
}

#[derive(Default)]
struct FakeChainState {
    allowances: HashMap<(Address, Address, Address), U256>,
    balances: HashMap<(Address, Address), VecDeque<U256>>,
    eth_balances: HashMap<Address, U256>,
    decimals: HashMap<Address, u8>,
    pending_nonces: HashMap<Address, u64>,
    send_results: VecDeque<Result<TxConfirmation, EngineError>>,
    sent: Vec<SentRequest>,
}

/// Scriptable chain double implementing every chain-facing trait.
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<FakeChainState>,
    nonce_fetches: AtomicU32,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_allowance(&self, token: Address, owner: Address, spender: Address, value: U256) {
        self.state
            .lock()
            .unwrap()
            .allowances
            .insert((token, owner, spender), value);
    }

    pub fn set_erc20_balance(&self, token: Address, account: Address, value: U256) {
        self.queue_erc20_balances(token, account, vec![value]);
    }

    /// Script a sequence of balance reads; the last value is sticky.
    pub fn queue_erc20_balances(&self, token: Address, account: Address, values: Vec<U256>) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert((token, account), values.into());
    }

    pub fn set_eth_balance(&self, account: Address, value: U256) {
        self.state.lock().unwrap().eth_balances.insert(account, value);
    }

    pub fn set_decimals(&self, token: Address, decimals: u8) {
        self.state.lock().unwrap().decimals.insert(token, decimals);
    }

    pub fn set_pending_nonce(&self, address: Address, nonce: u64) {
        self.state
            .lock()
            .unwrap()
            .pending_nonces
            .insert(address, nonce);
    }

    pub fn nonce_fetches(&self) -> u32 {
        self.nonce_fetches.load(Ordering::SeqCst)
    }

    pub fn push_send_result(&self, result: Result<TxConfirmation, EngineError>) {
        self.state.lock().unwrap().send_results.push_back(result);
    }

    pub fn sent_requests(&self) -> Vec<SentRequest> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl ChainReads for FakeChain {
    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, EngineError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn erc20_balance(&self, token: Address, account: Address) -> Result<U256, EngineError> {
        let mut state = self.state.lock().unwrap();
        let value = match state.balances.get_mut(&(token, account)) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(U256::ZERO),
            Some(queue) => queue.front().copied().unwrap_or(U256::ZERO),
            None => U256::ZERO,
        };
        Ok(value)
    }

    async fn erc20_decimals(&self, token: Address) -> Result<u8, EngineError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .decimals
            .get(&token)
            .copied()
            .unwrap_or(18))
    }

    async fn eth_balance(&self, account: Address) -> Result<U256, EngineError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .eth_balances
            .get(&account)
            .copied()
            .unwrap_or(U256::MAX))
    }
}

#[async_trait]
impl NonceSource for FakeChain {
    async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError> {
        self.nonce_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .unwrap()
            .pending_nonces
            .get(&address)
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl TxSubmitter for FakeChain {
    async fn estimate_gas(
        &self,
        _txr: &alloy_rpc_types_eth::TransactionRequest,
    ) -> Result<u64, EngineError> {
        Ok(100_000)
    }

    async fn send_and_wait(
        &self,
        txr: alloy_rpc_types_eth::TransactionRequest,
        _timeout: std::time::Duration,
    ) -> Result<TxConfirmation, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(SentRequest {
            to: txr.to.and_then(|kind| kind.to().copied()),
            nonce: txr.nonce,
            gas: txr.gas,
            value: txr.value,
        });
        match state.send_results.pop_front() {
            Some(result) => result,
            None => {
                let mut raw = [0u8; 32];
                raw[31] = state.sent.len() as u8;
                Ok(TxConfirmation {
                    tx_hash: B256::from(raw),
                    gas_used: 50_000,
                    effective_gas_price: 1_000_000_000,
                    success: true,
                    revert_reason: None,
                })
            }
        }
    }
}

/// A recorded mediated call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub tag: String,
    pub to: Address,
    pub calldata: Bytes,
}

/// Recording [`CallSender`] double.
#[derive(Default)]
pub struct FakeSender {
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallSender for FakeSender {
    async fn send_call(
        &self,
        tag: &str,
        to: Address,
        calldata: Bytes,
    ) -> Result<SentCall, EngineError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(RecordedCall {
            tag: tag.to_string(),
            to,
            calldata,
        });
        Ok(SentCall {
            tx_hash: format!("0xfff{:061x}", calls.len()),
        })
    }
}

/// Scriptable [`QuoteApi`] double.
#[derive(Default)]
pub struct FakeQuote {
    tokens: Mutex<Vec<TokenDescriptor>>,
    result: Mutex<Option<SwapPlan>>,
    requests: Mutex<Vec<CreateSwap>>,
}

impl FakeQuote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tokens(&self, tokens: Vec<TokenDescriptor>) {
        *self.tokens.lock().unwrap() = tokens;
    }

    pub fn set_result(&self, plan: SwapPlan) {
        *self.result.lock().unwrap() = Some(plan);
    }

    pub fn requests(&self) -> Vec<CreateSwap> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl QuoteApi for FakeQuote {
    async fn get_tokens(&self, _chain_ids: &[u64]) -> Result<Vec<TokenDescriptor>, EngineError> {
        Ok(self.tokens.lock().unwrap().clone())
    }

    async fn create_swap(&self, request: &CreateSwap) -> Result<SwapPlan, EngineError> {
        self.requests.lock().unwrap().push(request.clone());
        self.result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::QuoteUnavailable("no quote scripted".to_string()))
    }
}

/// Scriptable [`BatchExecutor`] double.
#[derive(Default)]
pub struct FakeBatchExecutor {
    outcome: Mutex<Option<BatchOutcome>>,
    batches: Mutex<Vec<(String, Vec<TransactionPlan>)>>,
}

impl FakeBatchExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, outcome: BatchOutcome) {
        *self.outcome.lock().unwrap() = Some(outcome);
    }

    pub fn batches(&self) -> Vec<(String, Vec<TransactionPlan>)> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchExecutor for FakeBatchExecutor {
    async fn execute_batch(
        &self,
        tag: &str,
        txs: &[TransactionPlan],
    ) -> Result<BatchOutcome, EngineError> {
        self.batches
            .lock()
            .unwrap()
            .push((tag.to_string(), txs.to_vec()));
        self.outcome
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::Internal("no batch outcome scripted".to_string()))
    }
}

/// Scriptable [`PlanRunner`] double for scheduler tests.
#[derive(Default)]
pub struct FakeRunner {
    invocations: Mutex<Vec<String>>,
    queued: Mutex<VecDeque<Result<(), EngineError>>>,
    fail_all: Mutex<bool>,
    fail_plans: Mutex<HashSet<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    /// Queue the outcome of the next invocation; the queue drains first,
    /// later invocations succeed.
    pub fn push_result(&self, result: Result<(), EngineError>) {
        self.queued.lock().unwrap().push_back(result);
    }

    pub fn fail_always(&self) {
        *self.fail_all.lock().unwrap() = true;
    }

    pub fn fail_plan(&self, id: &str) {
        self.fail_plans.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl PlanRunner for FakeRunner {
    async fn run_plan(&self, plan: &Plan) -> Result<Execution, EngineError> {
        self.invocations.lock().unwrap().push(plan.id.clone());
        if *self.fail_all.lock().unwrap() || self.fail_plans.lock().unwrap().contains(&plan.id) {
            return Err(EngineError::Internal("scripted failure".to_string()));
        }
        if let Some(result) = self.queued.lock().unwrap().pop_front() {
            result?;
        }
        Ok(execution_fixture(Some(plan.id.clone())))
    }
}

#[derive(Default)]
struct MemoryState {
    plans: HashMap<String, Plan>,
    leases: HashMap<String, DateTime<Utc>>,
    executions: Vec<Execution>,
    holdings: HashMap<(String, String), VaultHolding>,
    pause_after_claim: HashSet<String>,
}

/// In-memory [`PlanStore`] mirroring the Postgres claim/advance semantics.
#[derive(Default)]
pub struct MemoryPlanStore {
    state: Mutex<MemoryState>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.state.lock().unwrap().plans.insert(plan.id.clone(), plan);
    }

    pub fn plan_snapshot(&self, id: &str) -> Plan {
        self.state.lock().unwrap().plans.get(id).cloned().unwrap()
    }

    pub fn all_executions(&self) -> Vec<Execution> {
        self.state.lock().unwrap().executions.clone()
    }

    pub fn executions_for(&self, plan_id: &str) -> Vec<Execution> {
        self.state
            .lock()
            .unwrap()
            .executions
            .iter()
            .filter(|e| e.plan_id.as_deref() == Some(plan_id))
            .cloned()
            .collect()
    }

    /// Simulate an external writer pausing the plan right after a claim.
    pub fn pause_after_claim(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .pause_after_claim
            .insert(id.to_string());
    }

    pub fn lease_of(&self, id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().leases.get(id).copied()
    }

    pub fn seed_holding(&self, user: Address, vault: Address, symbol: &str, shares: &str) {
        let key = (user.to_string(), vault.to_string());
        self.state.lock().unwrap().holdings.insert(
            key,
            VaultHolding {
                user_address: user.to_string(),
                vault_address: vault.to_string(),
                token_symbol: symbol.to_string(),
                share_tokens: shares.to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
    }

    pub fn holding_shares(&self, user: Address, vault: Address) -> String {
        self.state
            .lock()
            .unwrap()
            .holdings
            .get(&(user.to_string(), vault.to_string()))
            .map(|h| h.share_tokens.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn claim_due_plans(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Plan>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut due: Vec<Plan> = state
            .plans
            .values()
            .filter(|p| p.status == PlanStatus::Active)
            .filter(|p| p.next_execution_at.is_some_and(|next| next <= now))
            .filter(|p| state.leases.get(&p.id).is_none_or(|until| *until <= now))
            .cloned()
            .collect();
        due.sort_by_key(|p| p.next_execution_at);
        for plan in &due {
            state.leases.insert(plan.id.clone(), now + lease);
        }
        let paused: Vec<String> = state
            .pause_after_claim
            .iter()
            .filter(|id| due.iter().any(|p| &p.id == *id))
            .cloned()
            .collect();
        for id in paused {
            if let Some(plan) = state.plans.get_mut(&id) {
                plan.status = PlanStatus::Paused;
            }
        }
        Ok(due)
    }

    async fn plan_by_id(&self, id: &str) -> Result<Option<Plan>, StoreError> {
        Ok(self.state.lock().unwrap().plans.get(id).cloned())
    }

    async fn release_lease(&self, id: &str) -> Result<(), StoreError> {
        self.state.lock().unwrap().leases.remove(id);
        Ok(())
    }

    async fn record_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let execution = Execution {
            id: uuid::Uuid::new_v4(),
            plan_id: new.plan_id,
            executed_at: Utc::now(),
            from_amount: new.from_amount,
            to_amount: new.to_amount,
            exchange_rate: new.exchange_rate,
            gas_fee: new.gas_fee,
            tx_hash: new.tx_hash,
            status: new.status,
            error_message: new.error_message,
            vault_address: new.vault_address,
            share_tokens: new.share_tokens,
            deposit_tx_hash: new.deposit_tx_hash,
        };
        self.state
            .lock()
            .unwrap()
            .executions
            .push(execution.clone());
        Ok(execution)
    }

    async fn advance_after_success(
        &self,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Plan, StoreError> {
        let mut state = self.state.lock().unwrap();
        let plan = state
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| StoreError::NotFound(plan_id.to_string()))?;
        plan.execution_count += 1;
        if plan.execution_count >= plan.total_executions {
            plan.status = PlanStatus::Completed;
            plan.next_execution_at = None;
        } else {
            plan.next_execution_at = Some(now + Duration::minutes(plan.interval_minutes));
        }
        plan.updated_at = now;
        let snapshot = plan.clone();
        state.leases.remove(plan_id);
        Ok(snapshot)
    }

    async fn upsert_vault_holding(
        &self,
        user_address: &str,
        vault_address: &str,
        token_symbol: &str,
        delta_shares: U256,
        share_decimals: u8,
    ) -> Result<VaultHolding, StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = (user_address.to_string(), vault_address.to_string());
        let now = Utc::now();
        let holding = match state.holdings.get_mut(&key) {
            Some(holding) => {
                holding.share_tokens =
                    add_share_amounts(&holding.share_tokens, delta_shares, share_decimals)?;
                holding.updated_at = now;
                holding.clone()
            }
            None => {
                let holding = VaultHolding {
                    user_address: user_address.to_string(),
                    vault_address: vault_address.to_string(),
                    token_symbol: token_symbol.to_string(),
                    share_tokens: format_units(delta_shares, share_decimals),
                    created_at: now,
                    updated_at: now,
                };
                state.holdings.insert(key, holding.clone());
                holding
            }
        };
        Ok(holding)
    }

    async fn latest_execution(&self, plan_id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .executions
            .iter()
            .filter(|e| e.plan_id.as_deref() == Some(plan_id))
            .max_by_key(|e| e.executed_at)
            .cloned())
    }

    async fn count_active_plans(&self) -> Result<i64, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .plans
            .values()
            .filter(|p| p.status == PlanStatus::Active)
            .count() as i64)
    }
}
