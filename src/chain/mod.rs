//! RPC gateway for the execution chain.
//!
//! [`ChainClient`] owns the composed Alloy provider (wallet signing, gas and
//! chain-id fillers over a [`RootProvider`]) and exposes the reads and raw
//! sends the rest of the engine needs. Every read is wrapped in the network
//! retry policy; sends are classified but never blindly resent here — resend
//! policy belongs to the transaction executor, which owns the nonce sequence.

pub mod contracts;

use std::time::Duration;

use alloy_network::{Ethereum as AlloyEthereum, EthereumWallet, NetworkWallet};
use alloy_primitives::{Address, B256, U256};
use alloy_provider::fillers::{
    ChainIdFiller, FillProvider, GasFiller, JoinFill, WalletFiller,
};
use alloy_provider::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{BlockId, TransactionRequest};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{Revert, SolError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::instrument;
use url::Url;

use crate::config::EvmPrivateKey;
use crate::error::EngineError;
use crate::retry::{is_network_error, is_nonce_error, retry};

use contracts::IERC20;

const CHAIN_MAX_RETRIES: u32 = 3;
const CHAIN_BASE_DELAY: Duration = Duration::from_secs(2);

/// Filler stack: gas pricing and chain id. Nonces are managed explicitly by
/// the transaction executor, so no nonce filler is installed.
pub type InnerFiller = JoinFill<GasFiller, ChainIdFiller>;

/// The fully composed provider type used by the engine.
pub type InnerProvider = FillProvider<
    JoinFill<JoinFill<Identity, InnerFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

/// Read access to ERC-20 state and native balances, abstracted for tests.
#[async_trait]
pub trait ChainReads: Send + Sync {
    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, EngineError>;
    async fn erc20_balance(&self, token: Address, account: Address) -> Result<U256, EngineError>;
    async fn erc20_decimals(&self, token: Address) -> Result<u8, EngineError>;
    async fn eth_balance(&self, account: Address) -> Result<U256, EngineError>;
}

/// Source of fresh account nonces, abstracted for tests.
#[async_trait]
pub trait NonceSource: Send + Sync {
    /// Transaction count at the `pending` tag, so in-mempool transactions
    /// are included after a restart.
    async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError>;
}

/// The receipt fields the engine consumes. Everything amount-bearing in the
/// audit history derives from these, never from quote estimates.
///
/// For a mined-but-reverted transaction, `revert_reason` carries the decoded
/// `Error(string)` payload recovered by replaying the call at the receipt's
/// block, when the node returns one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxConfirmation {
    pub tx_hash: B256,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub success: bool,
    pub revert_reason: Option<String>,
}

/// Gas estimation and raw transaction submission, abstracted for tests.
#[async_trait]
pub trait TxSubmitter: Send + Sync {
    async fn estimate_gas(&self, txr: &TransactionRequest) -> Result<u64, EngineError>;
    async fn send_and_wait(
        &self,
        txr: TransactionRequest,
        timeout: Duration,
    ) -> Result<TxConfirmation, EngineError>;
}

/// Everything the transaction executor needs from the chain.
pub trait ChainOps: TxSubmitter + ChainReads + NonceSource {}

impl<T: TxSubmitter + ChainReads + NonceSource> ChainOps for T {}

/// Provider wrapper bound to a single signing key on a single chain.
#[derive(Debug)]
pub struct ChainClient {
    inner: InnerProvider,
    signer_address: Address,
    chain_id: u64,
}

impl ChainClient {
    /// Connect to `rpc_url` with the executor hot key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for an unusable key and
    /// [`EngineError::Network`] when the RPC transport cannot be built.
    pub async fn connect(
        rpc_url: &Url,
        key: &EvmPrivateKey,
        chain_id: u64,
    ) -> Result<Self, EngineError> {
        let signer = PrivateKeySigner::from_bytes(&B256::from(*key.as_bytes()))
            .map_err(|e| EngineError::Validation(format!("invalid private key: {e}")))?
            .with_chain_id(Some(chain_id));
        let wallet = EthereumWallet::from(signer);
        let signer_address = NetworkWallet::<AlloyEthereum>::default_signer_address(&wallet);
        let client = RpcClient::builder()
            .connect(rpc_url.as_str())
            .await
            .map_err(|e| EngineError::Network(format!("failed to connect to {rpc_url}: {e}")))?;
        let filler = JoinFill::new(GasFiller, ChainIdFiller::default());
        let inner: InnerProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_client(client);
        tracing::info!(chain_id, signer = %signer_address, "chain client connected");
        Ok(Self {
            inner,
            signer_address,
            chain_id,
        })
    }

    /// Address of the executor hot key.
    pub fn signer_address(&self) -> Address {
        self.signer_address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Replay a mined-but-reverted transaction as an `eth_call` at its block
    /// to recover the revert output. Best effort: a node without the state,
    /// or a revert without `Error(string)` data, yields nothing.
    async fn recover_revert_reason(
        &self,
        txr: TransactionRequest,
        block_number: Option<u64>,
    ) -> Option<String> {
        let call = self.inner.call(txr);
        let call = match block_number {
            Some(number) => call.block(BlockId::number(number)),
            None => call,
        };
        match call.await {
            Ok(_) => None,
            Err(e) => decode_revert_reason(&e.to_string()),
        }
    }
}

#[async_trait]
impl TxSubmitter for ChainClient {
    /// Estimate gas for `txr` against the pending block.
    #[instrument(skip_all, err)]
    async fn estimate_gas(&self, txr: &TransactionRequest) -> Result<u64, EngineError> {
        retry(
            "estimate_gas",
            CHAIN_MAX_RETRIES,
            CHAIN_BASE_DELAY,
            |e: &EngineError| is_network_error(&e.to_string()),
            move || async move {
                self.inner
                    .estimate_gas(txr.clone())
                    .block(BlockId::pending())
                    .await
                    .map_err(classify_chain_error)
            },
        )
        .await
    }

    /// Broadcast a prepared transaction and wait for its receipt.
    ///
    /// No resend on failure: the caller owns retry policy because a resend
    /// needs a fresh nonce. A receipt with `reverted` status triggers an
    /// `eth_call` replay to decode the revert reason.
    #[instrument(skip_all, err)]
    async fn send_and_wait(
        &self,
        txr: TransactionRequest,
        timeout: Duration,
    ) -> Result<TxConfirmation, EngineError> {
        let replay = txr.clone();
        let pending = self
            .inner
            .send_transaction(txr)
            .await
            .map_err(classify_chain_error)?;
        let receipt = pending
            .with_timeout(Some(timeout))
            .get_receipt()
            .await
            .map_err(classify_chain_error)?;
        let success = receipt.status();
        let revert_reason = if success {
            None
        } else {
            self.recover_revert_reason(replay, receipt.block_number).await
        };
        Ok(TxConfirmation {
            tx_hash: receipt.transaction_hash,
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
            success,
            revert_reason,
        })
    }
}

#[async_trait]
impl ChainReads for ChainClient {
    #[instrument(skip(self), err)]
    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, EngineError> {
        retry(
            "erc20_allowance",
            CHAIN_MAX_RETRIES,
            CHAIN_BASE_DELAY,
            |e: &EngineError| is_network_error(&e.to_string()),
            move || async move {
                IERC20::new(token, &self.inner)
                    .allowance(owner, spender)
                    .call()
                    .await
                    .map_err(classify_chain_error)
            },
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn erc20_balance(&self, token: Address, account: Address) -> Result<U256, EngineError> {
        retry(
            "erc20_balance",
            CHAIN_MAX_RETRIES,
            CHAIN_BASE_DELAY,
            |e: &EngineError| is_network_error(&e.to_string()),
            move || async move {
                IERC20::new(token, &self.inner)
                    .balanceOf(account)
                    .call()
                    .await
                    .map_err(classify_chain_error)
            },
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn erc20_decimals(&self, token: Address) -> Result<u8, EngineError> {
        retry(
            "erc20_decimals",
            CHAIN_MAX_RETRIES,
            CHAIN_BASE_DELAY,
            |e: &EngineError| is_network_error(&e.to_string()),
            move || async move {
                IERC20::new(token, &self.inner)
                    .decimals()
                    .call()
                    .await
                    .map_err(classify_chain_error)
            },
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn eth_balance(&self, account: Address) -> Result<U256, EngineError> {
        retry(
            "eth_balance",
            CHAIN_MAX_RETRIES,
            CHAIN_BASE_DELAY,
            |e: &EngineError| is_network_error(&e.to_string()),
            move || async move {
                self.inner
                    .get_balance(account)
                    .await
                    .map_err(classify_chain_error)
            },
        )
        .await
    }
}

#[async_trait]
impl NonceSource for ChainClient {
    #[instrument(skip(self), err)]
    async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError> {
        retry(
            "pending_nonce",
            CHAIN_MAX_RETRIES,
            CHAIN_BASE_DELAY,
            |e: &EngineError| is_network_error(&e.to_string()),
            move || async move {
                self.inner
                    .get_transaction_count(address)
                    .pending()
                    .await
                    .map_err(classify_chain_error)
            },
        )
        .await
    }
}

/// Map a raw RPC-layer error onto the engine taxonomy by inspecting its
/// rendered message: nonce-shaped first, then revert data, then transport.
pub fn classify_chain_error(err: impl std::fmt::Display) -> EngineError {
    let message = err.to_string();
    if is_nonce_error(&message) {
        return EngineError::Nonce(message);
    }
    if let Some(reason) = decode_revert_reason(&message) {
        return EngineError::Reverted(reason);
    }
    let lowered = message.to_lowercase();
    if lowered.contains("revert") {
        return EngineError::Reverted(message);
    }
    if is_network_error(&message) || lowered.contains("connect") || lowered.contains("transport") {
        return EngineError::Network(message);
    }
    EngineError::Internal(message)
}

static REVERT_DATA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"0x08c379a0[0-9a-fA-F]+").expect("valid revert data regex"));

/// Extract and ABI-decode an `Error(string)` payload embedded in an error
/// message, if one is present.
pub fn decode_revert_reason(message: &str) -> Option<String> {
    let blob = REVERT_DATA_RE.find(message)?.as_str();
    let bytes = hex::decode(blob.trim_start_matches("0x")).ok()?;
    Revert::abi_decode(&bytes).ok().map(|r| r.reason)
}
