//! DCA engine entrypoint.
//!
//! Boot order: load `.env`, install tracing, connect the plan store (running
//! migrations), build the quote client and token registry, then — when a
//! signing key is configured — assemble the chain client, executor, custody,
//! vaults, and pipeline, and start the scheduler. Shutdown is signal-driven:
//! SIGTERM/SIGINT stop the ticker and in-flight executions run to completion.

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tokio::signal::unix::{SignalKind, signal};

use dca_engine::chain::ChainClient;
use dca_engine::config::Config;
use dca_engine::custody::CustodyManager;
use dca_engine::executor::TransactionExecutor;
use dca_engine::known;
use dca_engine::pipeline::SwapPipeline;
use dca_engine::quote::QuoteClient;
use dca_engine::registry::TokenRegistry;
use dca_engine::scheduler::PlanScheduler;
use dca_engine::store::PgPlanStore;
use dca_engine::telemetry;
use dca_engine::vault::VaultRegistry;

/// Block until SIGTERM or SIGINT.
async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        _ = sigint.recv() => tracing::info!("SIGINT received"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    telemetry::init();
    let config = Config::parse();

    let store = Arc::new(PgPlanStore::connect(&config.database_url).await?);
    let quote = Arc::new(QuoteClient::new(
        config.quote_endpoint.clone(),
        config.quote_connect_timeout(),
        config.quote_call_timeout(),
    )?);
    let registry = TokenRegistry::with_fallback().await;
    registry.refresh(quote.as_ref()).await;

    let Some(private_key) = config.private_key else {
        if config.enable_scheduler {
            tracing::error!("PRIVATE_KEY is required while the scheduler is enabled");
            std::process::exit(1);
        }
        tracing::warn!("PRIVATE_KEY not configured, running without execution");
        wait_for_shutdown().await?;
        return Ok(());
    };

    let chain = Arc::new(
        ChainClient::connect(
            &config.arbitrum_rpc_url,
            &private_key,
            known::ARBITRUM_CHAIN_ID,
        )
        .await?,
    );
    let executor_address = chain.signer_address();
    let executor = Arc::new(TransactionExecutor::new(
        chain.clone(),
        executor_address,
        known::ARBITRUM_CHAIN_ID,
    ));
    let custody = CustodyManager::new(
        chain.clone(),
        executor.clone(),
        executor_address,
        config.router_address,
    );
    let vaults = VaultRegistry::from_entries(
        &config.vaults.0,
        chain.clone(),
        executor.clone(),
        executor_address,
    );
    let pipeline = Arc::new(SwapPipeline::new(
        registry,
        custody,
        quote,
        executor,
        chain,
        store.clone(),
        vaults,
        executor_address,
        known::ARBITRUM_CHAIN_ID,
    ));

    let scheduler = Arc::new(PlanScheduler::new(
        store,
        pipeline,
        config.scheduler_config(),
    ));
    if config.enable_scheduler {
        scheduler.start()?;
    } else {
        tracing::warn!("scheduler disabled by configuration");
    }

    wait_for_shutdown().await?;
    scheduler.stop();
    tracing::info!("shutdown complete");
    Ok(())
}
