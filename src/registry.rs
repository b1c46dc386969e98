//! In-memory token registry.
//!
//! Maps uppercased symbols to ordered lists of token descriptors, refreshed
//! at startup from the quoting service and rebuildable at any time. Derived
//! state only; the plan store never references token addresses.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::known;
use crate::quote::QuoteApi;
use crate::types::TokenDescriptor;

/// Symbol-indexed token table. Read-mostly: built once at startup, refreshed
/// under a write lock.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<String, Vec<TokenDescriptor>>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-seeded with the documented fallback table.
    pub async fn with_fallback() -> Arc<Self> {
        let registry = Arc::new(Self::new());
        registry
            .replace_all(known::fallback_tokens())
            .await
            .expect("static fallback table contains no duplicates");
        registry
    }

    /// Insert a descriptor, preserving insertion order per symbol.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] when `(symbol, chain_id)` is
    /// already present.
    pub async fn insert(&self, token: TokenDescriptor) -> Result<(), EngineError> {
        let mut tokens = self.tokens.write().await;
        Self::insert_into(&mut tokens, token)
    }

    fn insert_into(
        tokens: &mut HashMap<String, Vec<TokenDescriptor>>,
        token: TokenDescriptor,
    ) -> Result<(), EngineError> {
        let symbol = token.symbol.to_uppercase();
        let entry = tokens.entry(symbol.clone()).or_default();
        if entry.iter().any(|t| t.chain_id == token.chain_id) {
            return Err(EngineError::Validation(format!(
                "duplicate token {symbol} on chain {}",
                token.chain_id
            )));
        }
        entry.push(TokenDescriptor {
            symbol: symbol.clone(),
            ..token
        });
        Ok(())
    }

    /// Replace the whole table atomically.
    pub async fn replace_all(&self, descriptors: Vec<TokenDescriptor>) -> Result<(), EngineError> {
        let mut fresh: HashMap<String, Vec<TokenDescriptor>> = HashMap::new();
        for token in descriptors {
            Self::insert_into(&mut fresh, token)?;
        }
        let mut tokens = self.tokens.write().await;
        *tokens = fresh;
        Ok(())
    }

    /// Resolve the first descriptor for `(uppercase symbol, chain_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TokenNotFound`] when no descriptor matches.
    pub async fn resolve(&self, symbol: &str, chain_id: u64) -> Result<TokenDescriptor, EngineError> {
        let upper = symbol.to_uppercase();
        let tokens = self.tokens.read().await;
        tokens
            .get(&upper)
            .and_then(|list| list.iter().find(|t| t.chain_id == chain_id))
            .cloned()
            .ok_or(EngineError::TokenNotFound {
                symbol: upper,
                chain_id,
            })
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Rebuild from the quoting service's live token list, keeping the
    /// current table (fallback or previous refresh) when the call fails.
    pub async fn refresh<Q: QuoteApi + ?Sized>(&self, quote: &Q) {
        match quote.get_tokens(&[known::ARBITRUM_CHAIN_ID]).await {
            Ok(descriptors) if !descriptors.is_empty() => {
                let count = descriptors.len();
                match self.replace_all(descriptors).await {
                    Ok(()) => info!(tokens = count, "token registry refreshed"),
                    Err(e) => warn!(error = %e, "token list rejected, keeping current table"),
                }
            }
            Ok(_) => warn!("quoting service returned an empty token list, keeping current table"),
            Err(e) => {
                warn!(error = %e, "token list fetch failed, keeping current table");
            }
        }
    }
}
