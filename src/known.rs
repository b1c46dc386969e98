//! Well-known Arbitrum deployments used as a fallback when the quoting
//! service cannot be reached at startup.
//!
//! The table pins the documented token addresses the engine is expected to
//! trade out of the box. The registry prefers the quoting service's live
//! token list and only seeds from here when that call fails after retries.

use alloy_primitives::{Address, address};

use crate::types::TokenDescriptor;

/// The single chain this engine executes on.
pub const ARBITRUM_CHAIN_ID: u64 = 42161;

/// Default Arbitrum RPC endpoint.
pub const DEFAULT_RPC_URL: &str = "https://arb1.arbitrum.io/rpc";

/// Swap router granted pre-approval on Arbitrum. The quoting service routes
/// its transactions through this contract; it is a deployment constant and
/// can be overridden via `SWAP_ROUTER_ADDRESS`.
pub const DEFAULT_ROUTER_ADDRESS: &str = "0x1111111254EEB25477B68fb85Ed929f73A960582";

/// A statically known token deployment.
struct KnownToken {
    symbol: &'static str,
    address: Address,
    decimals: u8,
    name: &'static str,
}

/// Documented Arbitrum token deployments.
///
/// USDC has two deployments: the native Circle issue under `USDC` and the
/// bridged issue under `USDC.E`. Both declare 6 decimals, and amount parsing
/// always uses the descriptor's declared decimals.
static KNOWN_TOKENS: &[KnownToken] = &[
    KnownToken {
        symbol: "USDC",
        address: address!("0xaf88d065e77c8cC2239327C5EDb3A432268e5831"),
        decimals: 6,
        name: "USD Coin",
    },
    KnownToken {
        symbol: "USDC.E",
        address: address!("0xFF970A61A04b1cA14834A43f5dE4533eBDDB5CC8"),
        decimals: 6,
        name: "Bridged USDC",
    },
    KnownToken {
        symbol: "WETH",
        address: address!("0x82aF49447D8a07e3bd95BD0d56f35241523fBab1"),
        decimals: 18,
        name: "Wrapped Ether",
    },
    KnownToken {
        symbol: "ARB",
        address: address!("0x912CE59144191C1204E64559FE8253a0e49E6548"),
        decimals: 18,
        name: "Arbitrum",
    },
    KnownToken {
        symbol: "USDT",
        address: address!("0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9"),
        decimals: 6,
        name: "Tether USD",
    },
    KnownToken {
        symbol: "WBTC",
        address: address!("0x2f2a2543B76A4166549F7aaB2e75Bef0aefC5B0f"),
        decimals: 8,
        name: "Wrapped BTC",
    },
    KnownToken {
        symbol: "DAI",
        address: address!("0xDA10009cBd5D07dd0CeCc66161FC93D7c9000da1"),
        decimals: 18,
        name: "Dai Stablecoin",
    },
];

/// Descriptors for the static fallback table.
pub fn fallback_tokens() -> Vec<TokenDescriptor> {
    KNOWN_TOKENS
        .iter()
        .map(|t| TokenDescriptor {
            symbol: t.symbol.to_string(),
            chain_id: ARBITRUM_CHAIN_ID,
            address: t.address,
            decimals: t.decimals,
            name: t.name.to_string(),
        })
        .collect()
}
