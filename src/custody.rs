//! Pre-swap token custody.
//!
//! Before the router transactions are broadcast, the executor must hold the
//! swap amount of the source token and the router must be able to pull it.
//! Two arrangements exist: self-execution, where the user address is the
//! executor's own key, and separate-executor, where funds are drawn from the
//! user via a prior ERC-20 allowance to the executor.

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolCall;
use tracing::{info, instrument};

use crate::chain::ChainReads;
use crate::chain::contracts::IERC20;
use crate::error::EngineError;
use crate::executor::CallSender;
use crate::types::TokenDescriptor;

/// Enforces custody invariants ahead of a swap: after a successful return,
/// the executor holds at least the swap amount and the router allowance
/// covers it.
pub struct CustodyManager {
    chain: Arc<dyn ChainReads>,
    sender: Arc<dyn CallSender>,
    executor_address: Address,
    router_address: Address,
}

impl CustodyManager {
    pub fn new(
        chain: Arc<dyn ChainReads>,
        sender: Arc<dyn CallSender>,
        executor_address: Address,
        router_address: Address,
    ) -> Self {
        Self {
            chain,
            sender,
            executor_address,
            router_address,
        }
    }

    /// Ensure the executor can spend `amount` of `token` through the router
    /// on behalf of `user`.
    ///
    /// Idempotent: re-running with no intervening on-chain activity performs
    /// zero writes, because the approval is already unlimited and the pull is
    /// skipped while the executor still holds the amount.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InsufficientUserApproval`] in separate-executor
    /// mode when the user's allowance to the executor does not cover `amount`.
    #[instrument(skip(self, token), err, fields(
        token = %token.symbol,
        amount = %amount,
        user = %user,
    ))]
    pub async fn ensure(
        &self,
        token: &TokenDescriptor,
        amount: U256,
        user: Address,
    ) -> Result<(), EngineError> {
        if user == self.executor_address {
            self.ensure_router_allowance(token.address, user, amount)
                .await
        } else {
            self.ensure_router_allowance(token.address, self.executor_address, amount)
                .await?;
            self.pull_from_user(token, amount, user).await
        }
    }

    /// Top the `owner -> router` allowance up to unlimited when it cannot
    /// cover `amount`. The approval is sent from the executor key, so `owner`
    /// is always the executor (or the user in self-execution mode, where the
    /// two are the same account).
    async fn ensure_router_allowance(
        &self,
        token: Address,
        owner: Address,
        amount: U256,
    ) -> Result<(), EngineError> {
        let allowance = self
            .chain
            .erc20_allowance(token, owner, self.router_address)
            .await?;
        if allowance >= amount {
            return Ok(());
        }
        let calldata = IERC20::approveCall {
            spender: self.router_address,
            value: U256::MAX,
        }
        .abi_encode();
        let sent = self
            .sender
            .send_call("approve_router", token, calldata.into())
            .await?;
        info!(token = %token, tx = %sent.tx_hash, "router allowance raised to unlimited");
        Ok(())
    }

    /// Draw `amount` from the user into the executor, unless the executor
    /// already holds it from a prior partial run.
    async fn pull_from_user(
        &self,
        token: &TokenDescriptor,
        amount: U256,
        user: Address,
    ) -> Result<(), EngineError> {
        let user_allowance = self
            .chain
            .erc20_allowance(token.address, user, self.executor_address)
            .await?;
        if user_allowance < amount {
            return Err(EngineError::InsufficientUserApproval {
                allowance: user_allowance,
                required: amount,
            });
        }
        let held = self
            .chain
            .erc20_balance(token.address, self.executor_address)
            .await?;
        if held >= amount {
            return Ok(());
        }
        let calldata = IERC20::transferFromCall {
            from: user,
            to: self.executor_address,
            value: amount,
        }
        .abi_encode();
        let sent = self
            .sender
            .send_call("pull_user_funds", token.address, calldata.into())
            .await?;
        info!(
            token = %token.symbol,
            amount = %amount,
            user = %user,
            tx = %sent.tx_hash,
            "user funds pulled into executor"
        );
        Ok(())
    }
}
