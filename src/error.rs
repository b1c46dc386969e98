//! Engine-wide error taxonomy.
//!
//! Every fallible path in the pipeline ends up in [`EngineError`]. Retry
//! classification (see [`crate::retry`]) operates on the rendered message,
//! so the `Display` text of each variant is part of the contract: failed
//! executions persist it verbatim into the audit history.

use alloy_primitives::U256;

use crate::store::StoreError;

/// Errors surfaced by the scheduling and execution pipeline.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed plan fields, bad addresses, bad hex calldata. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Symbol is not present in the token registry for the target chain.
    #[error("Token not found: {symbol} on chain {chain_id}")]
    TokenNotFound { symbol: String, chain_id: u64 },

    /// The user has not granted the executor enough allowance to pull funds.
    /// The plan is not advanced; the next tick retries at the next interval.
    #[error("Insufficient user approval: allowance {allowance} < required {required}")]
    InsufficientUserApproval { allowance: U256, required: U256 },

    /// The executor does not hold enough of the token for the operation.
    #[error("Insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: U256, required: U256 },

    /// The executor does not hold enough ETH to cover a transaction `value`.
    #[error("Insufficient ETH balance: have {balance}, need {required}")]
    InsufficientEth { balance: U256, required: U256 },

    /// The quoting service returned zero transactions or an invalid payload.
    #[error("Quote unavailable: {0}")]
    QuoteUnavailable(String),

    /// Transport-level failure against the RPC node or the quote service.
    #[error("Network error: {0}")]
    Network(String),

    /// A send failed with a nonce-shaped message. The nonce cache is reset
    /// and the send retried.
    #[error("Nonce error: {0}")]
    Nonce(String),

    /// The transaction was mined but its receipt reports `reverted`.
    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Any other unexpected condition.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Internal helper for wrapping opaque error sources.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        EngineError::Internal(err.to_string())
    }

    /// Wrap a transport-level failure.
    pub fn network(err: impl std::fmt::Display) -> Self {
        EngineError::Network(err.to_string())
    }
}
