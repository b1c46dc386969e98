//! Optional post-swap vault integration.
//!
//! When a destination token has a configured vault, the swap pipeline
//! deposits the exact received delta and credits the user with the minted
//! shares. The module's contract is balance-diff correctness: shares are
//! measured by snapshotting the receiver's share balance around the deposit,
//! never taken from contract return values or quote estimates, and share
//! arithmetic runs at the vault's own `decimals()`.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::chain::ChainReads;
use crate::chain::contracts::{IERC20, IERC4626, ISimpleVault};
use crate::error::EngineError;
use crate::executor::CallSender;

/// Which deposit/withdraw shape a configured vault speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultKind {
    Erc4626,
    Simple,
}

/// Result of a vault deposit, measured on-chain.
#[derive(Debug, Clone)]
pub struct VaultDeposit {
    /// Minted shares, decimal string at the vault's share decimals.
    pub share_tokens: String,
    /// The same shares in atomic units, for holding arithmetic.
    pub shares_atomic: U256,
    pub share_decimals: u8,
    pub deposit_tx_hash: String,
}

/// Result of a vault withdrawal. Assets received are measured by the caller
/// by diffing the executor's token balance.
#[derive(Debug, Clone)]
pub struct VaultWithdrawal {
    pub withdraw_tx_hash: String,
}

/// Deposit/withdraw against one vault shape.
#[async_trait]
pub trait VaultAdapter: Send + Sync {
    async fn deposit(
        &self,
        token: Address,
        vault: Address,
        amount: U256,
        user: Address,
    ) -> Result<VaultDeposit, EngineError>;

    async fn withdraw(
        &self,
        vault: Address,
        shares: U256,
        user: Address,
    ) -> Result<VaultWithdrawal, EngineError>;
}

/// Shared plumbing for both adapter shapes.
struct VaultCore {
    chain: Arc<dyn ChainReads>,
    sender: Arc<dyn CallSender>,
    executor_address: Address,
}

impl VaultCore {
    /// Preconditions for any deposit: the executor actually holds the amount
    /// and the vault can pull it.
    async fn prepare_deposit(
        &self,
        token: Address,
        vault: Address,
        amount: U256,
    ) -> Result<(), EngineError> {
        let balance = self
            .chain
            .erc20_balance(token, self.executor_address)
            .await?;
        if balance < amount {
            return Err(EngineError::InsufficientBalance {
                balance,
                required: amount,
            });
        }
        let allowance = self
            .chain
            .erc20_allowance(token, self.executor_address, vault)
            .await?;
        if allowance < amount {
            let calldata = IERC20::approveCall {
                spender: vault,
                value: U256::MAX,
            }
            .abi_encode();
            self.sender
                .send_call("approve_vault", token, calldata.into())
                .await?;
        }
        Ok(())
    }

    /// Submit the deposit call and measure minted shares as the receiver's
    /// share-balance delta, formatted at the vault's own decimals.
    async fn deposit_and_measure(
        &self,
        vault: Address,
        receiver: Address,
        calldata: Vec<u8>,
    ) -> Result<VaultDeposit, EngineError> {
        let share_decimals = self.chain.erc20_decimals(vault).await?;
        let before = self.chain.erc20_balance(vault, receiver).await?;
        let sent = self
            .sender
            .send_call("vault_deposit", vault, calldata.into())
            .await?;
        let after = self.chain.erc20_balance(vault, receiver).await?;
        let shares_atomic = after.saturating_sub(before);
        let share_tokens = crate::types::format_units(shares_atomic, share_decimals);
        info!(
            vault = %vault,
            shares = %share_tokens,
            tx = %sent.tx_hash,
            "vault deposit confirmed"
        );
        Ok(VaultDeposit {
            share_tokens,
            shares_atomic,
            share_decimals,
            deposit_tx_hash: sent.tx_hash,
        })
    }
}

/// ERC-4626 vault: `deposit(assets, receiver)` mints shares directly to the
/// user; `redeem(shares, receiver, owner)` burns the user's shares and pays
/// assets to the executor.
pub struct Erc4626Vault(VaultCore);

impl Erc4626Vault {
    pub fn new(
        chain: Arc<dyn ChainReads>,
        sender: Arc<dyn CallSender>,
        executor_address: Address,
    ) -> Self {
        Self(VaultCore {
            chain,
            sender,
            executor_address,
        })
    }
}

#[async_trait]
impl VaultAdapter for Erc4626Vault {
    #[instrument(skip(self), err)]
    async fn deposit(
        &self,
        token: Address,
        vault: Address,
        amount: U256,
        user: Address,
    ) -> Result<VaultDeposit, EngineError> {
        self.0.prepare_deposit(token, vault, amount).await?;
        let calldata = IERC4626::depositCall {
            assets: amount,
            receiver: user,
        }
        .abi_encode();
        self.0.deposit_and_measure(vault, user, calldata).await
    }

    #[instrument(skip(self), err)]
    async fn withdraw(
        &self,
        vault: Address,
        shares: U256,
        user: Address,
    ) -> Result<VaultWithdrawal, EngineError> {
        let calldata = IERC4626::redeemCall {
            shares,
            receiver: self.0.executor_address,
            owner: user,
        }
        .abi_encode();
        let sent = self
            .0
            .sender
            .send_call("vault_redeem", vault, calldata.into())
            .await?;
        Ok(VaultWithdrawal {
            withdraw_tx_hash: sent.tx_hash,
        })
    }
}

/// Simplified vault: `deposit(amount)` credits the caller, so shares land on
/// the executor and the user is credited in the holdings ledger instead.
pub struct SimpleVault(VaultCore);

impl SimpleVault {
    pub fn new(
        chain: Arc<dyn ChainReads>,
        sender: Arc<dyn CallSender>,
        executor_address: Address,
    ) -> Self {
        Self(VaultCore {
            chain,
            sender,
            executor_address,
        })
    }
}

#[async_trait]
impl VaultAdapter for SimpleVault {
    #[instrument(skip(self), err)]
    async fn deposit(
        &self,
        token: Address,
        vault: Address,
        amount: U256,
        _user: Address,
    ) -> Result<VaultDeposit, EngineError> {
        self.0.prepare_deposit(token, vault, amount).await?;
        let calldata = ISimpleVault::depositCall { amount }.abi_encode();
        self.0
            .deposit_and_measure(vault, self.0.executor_address, calldata)
            .await
    }

    #[instrument(skip(self), err)]
    async fn withdraw(
        &self,
        vault: Address,
        shares: U256,
        _user: Address,
    ) -> Result<VaultWithdrawal, EngineError> {
        let calldata = ISimpleVault::withdrawCall { shares }.abi_encode();
        let sent = self
            .0
            .sender
            .send_call("vault_withdraw", vault, calldata.into())
            .await?;
        Ok(VaultWithdrawal {
            withdraw_tx_hash: sent.tx_hash,
        })
    }
}

/// A configured vault destination for one token symbol.
#[derive(Clone)]
pub struct VaultTarget {
    pub address: Address,
    pub adapter: Arc<dyn VaultAdapter>,
}

/// Deployment-configured mapping from destination token symbol to vault.
#[derive(Clone, Default)]
pub struct VaultRegistry {
    vaults: HashMap<String, VaultTarget>,
}

/// One entry of the `VAULT_CONFIG` JSON array.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfigEntry {
    pub token: String,
    pub address: Address,
    pub kind: VaultKind,
}

impl VaultRegistry {
    pub fn from_entries(
        entries: &[VaultConfigEntry],
        chain: Arc<dyn ChainReads>,
        sender: Arc<dyn CallSender>,
        executor_address: Address,
    ) -> Self {
        let mut vaults = HashMap::new();
        for entry in entries {
            let adapter: Arc<dyn VaultAdapter> = match entry.kind {
                VaultKind::Erc4626 => Arc::new(Erc4626Vault::new(
                    chain.clone(),
                    sender.clone(),
                    executor_address,
                )),
                VaultKind::Simple => Arc::new(SimpleVault::new(
                    chain.clone(),
                    sender.clone(),
                    executor_address,
                )),
            };
            vaults.insert(
                entry.token.to_uppercase(),
                VaultTarget {
                    address: entry.address,
                    adapter,
                },
            );
        }
        Self { vaults }
    }

    /// Vault configured for a destination token, if any.
    pub fn for_token(&self, symbol: &str) -> Option<&VaultTarget> {
        self.vaults.get(&symbol.to_uppercase())
    }

    #[cfg(test)]
    pub fn with_target(symbol: &str, target: VaultTarget) -> Self {
        let mut vaults = HashMap::new();
        vaults.insert(symbol.to_uppercase(), target);
        Self { vaults }
    }
}
