//! Generic retry combinator with pluggable retryability predicates.
//!
//! One combinator serves every call site: the quote client and chain reads
//! retry on transport-shaped errors, the transaction executor retries on
//! nonce-shaped errors. Backoff is progressive: `base_delay * attempt`.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Message fragments that classify an error as a transient transport failure.
const NETWORK_ERROR_MARKERS: &[&str] = &[
    "fetch failed",
    "etimedout",
    "econnreset",
    "enotfound",
    "network",
    "timeout",
];

/// Message fragments that classify an error as a nonce collision.
const NONCE_ERROR_MARKERS: &[&str] = &["nonce", "transaction underpriced", "already known"];

/// True when the message matches the network-retryable predicate.
pub fn is_network_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    NETWORK_ERROR_MARKERS.iter().any(|m| lowered.contains(m))
}

/// True when the message matches the nonce-retryable predicate.
pub fn is_nonce_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    NONCE_ERROR_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Run `op`, retrying on errors accepted by `is_retryable`.
///
/// `max_retries` counts additional attempts after the first: the operation
/// runs at most `max_retries + 1` times. The sleep before retry `n` is
/// `base_delay * n`. Non-retryable errors propagate immediately.
pub async fn retry<T, E, Op, Fut, P>(
    name: &str,
    max_retries: u32,
    base_delay: Duration,
    is_retryable: P,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt > max_retries || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = base_delay * attempt;
                warn!(
                    operation = name,
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
