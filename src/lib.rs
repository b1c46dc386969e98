//! Multi-tenant dollar-cost-averaging execution engine for Arbitrum.
//!
//! The engine turns persisted DCA plans into on-chain swap transactions with
//! at-most-once per interval semantics, bounded concurrency, and a durable
//! audit history. Plans are created by an external CRUD surface; this crate
//! owns everything between "a plan is due" and "tokens moved on chain".
//!
//! # Architecture
//!
//! - [`scheduler`] — the periodic driver: claims due plans from the store and
//!   fans them out in bounded parallel batches with per-plan retry and error
//!   isolation.
//! - [`pipeline`] — one DCA iteration: resolve tokens, secure custody, fetch
//!   a quote, broadcast, measure balance deltas, optionally deposit into a
//!   vault, record the execution, advance the plan.
//! - [`executor`] — the single-writer signer with cached monotonic nonces,
//!   gas estimation, fee handling, receipt waiting, and revert decoding.
//!   Every signed transaction in the process flows through it.
//! - [`custody`] — pre-swap invariants: router allowance and, when user and
//!   executor differ, pulling funds from the user via `transferFrom`.
//! - [`vault`] — optional post-swap deposit of the received delta into an
//!   ERC-4626 or simplified vault, with balance-diff share accounting.
//! - [`store`] — Postgres source of truth for plans, executions, and vault
//!   holdings, with row-level leases against double execution.
//! - [`quote`] — RPC client for the external quoting service.
//! - [`registry`] / [`known`] — symbol-to-token resolution with a documented
//!   static fallback.
//! - [`chain`] — the Alloy provider wrapper: ERC-20 reads, gas estimation,
//!   raw sends, nonce queries.
//! - [`retry`] — the generic retry combinator with network- and nonce-shaped
//!   predicates.

pub mod chain;
pub mod config;
pub mod custody;
pub mod error;
pub mod executor;
pub mod known;
pub mod pipeline;
pub mod quote;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod vault;

#[cfg(test)]
pub(crate) mod testutil;
