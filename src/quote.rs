//! RPC client for the external quoting service.
//!
//! The quoting service is a black box that, given a token pair and an amount,
//! returns a list of atomic transactions to broadcast in order. Responses are
//! deserialized into typed records at ingress; transport failures are retried
//! with the network predicate, payload validation failures are not.

use std::time::Duration;

use alloy_primitives::Address;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::EngineError;
use crate::retry::{is_network_error, retry};
use crate::types::{TokenDescriptor, TransactionPlan};

const QUOTE_MAX_RETRIES: u32 = 3;
const QUOTE_BASE_DELAY: Duration = Duration::from_secs(5);

/// Slippage below this floor is clamped up before the quote request.
const SLIPPAGE_FLOOR: &str = "0.3";

/// A swap proposal: transactions to broadcast plus display amounts for the
/// audit history. Display amounts are never used for persisted balance math.
#[derive(Debug, Clone)]
pub struct SwapPlan {
    pub transactions: Vec<TransactionPlan>,
    pub display_from_amount: Option<String>,
    pub display_to_amount: String,
    pub effective_price: String,
}

/// Parameters for a `createSwap` call.
#[derive(Debug, Clone)]
pub struct CreateSwap {
    pub chain_id: u64,
    pub base_token: Address,
    pub quote_token: Address,
    /// Atomic units of the base token, decimal string.
    pub amount: String,
    /// The end user; the executor only mediates custody.
    pub recipient: Address,
    /// Percentage string, already clamped to the floor.
    pub slippage_tolerance: String,
}

/// Remote quoting operations, abstracted for tests.
#[async_trait]
pub trait QuoteApi: Send + Sync {
    async fn get_tokens(&self, chain_ids: &[u64]) -> Result<Vec<TokenDescriptor>, EngineError>;
    async fn create_swap(&self, request: &CreateSwap) -> Result<SwapPlan, EngineError>;
}

/// Clamp a slippage percentage to the 0.3% floor.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] on non-numeric or negative input.
pub fn normalize_slippage(slippage_percent: &str) -> Result<String, EngineError> {
    let parsed: Decimal = slippage_percent
        .trim()
        .parse()
        .map_err(|_| EngineError::Validation(format!("invalid slippage: {slippage_percent}")))?;
    if parsed.is_sign_negative() {
        return Err(EngineError::Validation(format!(
            "negative slippage: {slippage_percent}"
        )));
    }
    let floor: Decimal = SLIPPAGE_FLOOR.parse().expect("valid floor constant");
    if parsed < floor {
        Ok(SLIPPAGE_FLOOR.to_string())
    } else {
        Ok(parsed.normalize().to_string())
    }
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorPayload>,
}

#[derive(Deserialize)]
struct RpcErrorPayload {
    code: i64,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetTokensParams<'a> {
    chain_ids: &'a [u64],
}

#[derive(Deserialize, Debug)]
struct GetTokensResult {
    tokens: Vec<TokenPayload>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TokenPayload {
    symbol: String,
    chain_id: u64,
    address: String,
    decimals: u8,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRef {
    chain_id: u64,
    address: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSwapParams {
    base_token: TokenRef,
    quote_token: TokenRef,
    amount: String,
    recipient: String,
    slippage_tolerance: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapPlanPayload {
    transactions: Vec<TransactionPlan>,
    #[serde(default)]
    display_from_amount: Option<String>,
    display_to_amount: String,
    estimation: SwapEstimationPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapEstimationPayload {
    effective_price: String,
}

fn into_result<T>(response: RpcResponse<T>, method: &str) -> Result<T, EngineError> {
    if let Some(error) = response.error {
        return Err(EngineError::QuoteUnavailable(format!(
            "{method} failed with code {}: {}",
            error.code, error.message
        )));
    }
    response.result.ok_or_else(|| {
        EngineError::QuoteUnavailable(format!("{method} returned neither result nor error"))
    })
}

/// HTTP client for the quoting service's RPC interface.
#[derive(Debug, Clone)]
pub struct QuoteClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl QuoteClient {
    /// Build a client with the configured connection and per-call timeouts.
    pub fn new(
        endpoint: Url,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(call_timeout)
            .build()
            .map_err(EngineError::network)?;
        Ok(Self { http, endpoint })
    }

    /// One RPC round trip with network retry. Transport and HTTP-status
    /// failures are retryable; a payload that fails to decode is not.
    async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<T, EngineError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };
        let request = &request;
        let http = &self.http;
        let endpoint = &self.endpoint;
        let response = retry(
            method,
            QUOTE_MAX_RETRIES,
            QUOTE_BASE_DELAY,
            |e: &EngineError| is_network_error(&e.to_string()),
            move || async move {
                let response = http
                    .post(endpoint.clone())
                    .json(request)
                    .send()
                    .await
                    .map_err(EngineError::network)?
                    .error_for_status()
                    .map_err(EngineError::network)?;
                response
                    .json::<RpcResponse<T>>()
                    .await
                    .map_err(|e| EngineError::QuoteUnavailable(format!("{method}: {e}")))
            },
        )
        .await?;
        into_result(response, method)
    }
}

#[async_trait]
impl QuoteApi for QuoteClient {
    /// Fetch the flat token list used to build the token registry.
    #[instrument(skip(self), err)]
    async fn get_tokens(&self, chain_ids: &[u64]) -> Result<Vec<TokenDescriptor>, EngineError> {
        let result: GetTokensResult = self
            .call("getTokens", GetTokensParams { chain_ids })
            .await?;
        let mut descriptors = Vec::with_capacity(result.tokens.len());
        for token in result.tokens {
            let address: Address = match token.address.parse() {
                Ok(a) => a,
                Err(e) => {
                    warn!(symbol = %token.symbol, address = %token.address, error = %e,
                        "skipping token with malformed address");
                    continue;
                }
            };
            descriptors.push(TokenDescriptor {
                symbol: token.symbol.to_uppercase(),
                chain_id: token.chain_id,
                address,
                decimals: token.decimals,
                name: token.name.unwrap_or_default(),
            });
        }
        debug!(tokens = descriptors.len(), "token list fetched");
        Ok(descriptors)
    }

    /// Request a swap plan routing `amount` of the base token into the quote
    /// token, delivered to `recipient`.
    #[instrument(skip(self, request), err, fields(
        base = %request.base_token,
        quote = %request.quote_token,
        amount = %request.amount,
    ))]
    async fn create_swap(&self, request: &CreateSwap) -> Result<SwapPlan, EngineError> {
        let params = CreateSwapParams {
            base_token: TokenRef {
                chain_id: request.chain_id,
                address: request.base_token.to_string(),
            },
            quote_token: TokenRef {
                chain_id: request.chain_id,
                address: request.quote_token.to_string(),
            },
            amount: request.amount.clone(),
            recipient: request.recipient.to_string(),
            slippage_tolerance: request.slippage_tolerance.clone(),
        };
        let payload: SwapPlanPayload = self.call("createSwap", params).await?;
        Ok(SwapPlan {
            transactions: payload.transactions,
            display_from_amount: payload.display_from_amount,
            display_to_amount: payload.display_to_amount,
            effective_price: payload.estimation.effective_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slippage_is_clamped_to_floor() {
        assert_eq!(normalize_slippage("0.1").unwrap(), "0.3");
        assert_eq!(normalize_slippage("0").unwrap(), "0.3");
        assert_eq!(normalize_slippage("0.3").unwrap(), "0.3");
        assert_eq!(normalize_slippage("2").unwrap(), "2");
        assert_eq!(normalize_slippage("2.50").unwrap(), "2.5");
    }

    #[test]
    fn slippage_rejects_garbage() {
        assert!(normalize_slippage("-1").is_err());
        assert!(normalize_slippage("two percent").is_err());
    }

    #[test]
    fn swap_plan_payload_deserializes() {
        let json = r#"{
            "transactions": [
                {"chainId": 42161, "to": "0x1111111254EEB25477B68fb85Ed929f73A960582", "data": "0xdeadbeef"}
            ],
            "displayFromAmount": "100",
            "displayToAmount": "0.03",
            "estimation": {"effectivePrice": "3333.33"}
        }"#;
        let payload: SwapPlanPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.transactions.len(), 1);
        assert_eq!(payload.display_to_amount, "0.03");
        assert_eq!(payload.estimation.effective_price, "3333.33");
    }

    #[test]
    fn swap_plan_payload_requires_display_to_amount() {
        let json = r#"{"transactions": [], "estimation": {"effectivePrice": "1"}}"#;
        assert!(serde_json::from_str::<SwapPlanPayload>(json).is_err());
    }

    #[test]
    fn rpc_error_maps_to_quote_unavailable() {
        let response: RpcResponse<GetTokensResult> = serde_json::from_str(
            r#"{"error": {"code": -32000, "message": "no route found"}}"#,
        )
        .unwrap();
        let err = into_result(response, "createSwap").unwrap_err();
        assert!(matches!(err, EngineError::QuoteUnavailable(_)));
        assert!(err.to_string().contains("no route found"));
    }

    #[test]
    fn missing_result_and_error_is_invalid() {
        let response: RpcResponse<GetTokensResult> = serde_json::from_str("{}").unwrap();
        assert!(into_result(response, "getTokens").is_err());
    }
}
