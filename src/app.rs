use crate::config::{Config, StoreBackend};
use crate::handlers;
use crate::models::Network;
use crate::services::{
    Analytics, BalanceQuery, ChainClient, EthersChainClient, MemoryVoucherStore,
    RedisVoucherStore, SettlementOrchestrator, VerificationService, VoucherStore,
    VoucherValidator,
};
use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a request handler needs, built once at startup.
pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn VoucherStore>,
    pub verification: VerificationService,
    pub settlement: Arc<SettlementOrchestrator>,
    pub balances: BalanceQuery,
    pub analytics: Arc<Analytics>,
}

impl AppContext {
    pub fn new(
        config: Config,
        store: Arc<dyn VoucherStore>,
        chains: HashMap<Network, Arc<dyn ChainClient>>,
    ) -> Self {
        let analytics = Arc::new(Analytics::new());
        let validator = VoucherValidator::new(config.domains(), config.max_voucher_validity_secs);

        Self {
            verification: VerificationService::new(validator, store.clone(), analytics.clone()),
            settlement: Arc::new(SettlementOrchestrator::new(
                store.clone(),
                chains,
                config.settlement_timeout(),
                analytics.clone(),
            )),
            balances: BalanceQuery::new(store.clone()),
            store,
            analytics,
            config,
        }
    }

    /// Connects the configured store and a chain client for every network with
    /// settlement credentials.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store: Arc<dyn VoucherStore> = match config.store_backend {
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory voucher store; vouchers are lost on restart");
                Arc::new(MemoryVoucherStore::new())
            }
            StoreBackend::Redis => Arc::new(
                RedisVoucherStore::new(&config.redis_url)
                    .await
                    .context("Failed to connect voucher store")?,
            ),
        };

        let mut chains: HashMap<Network, Arc<dyn ChainClient>> = HashMap::new();
        for network in &config.networks {
            let Some((rpc_url, private_key, contract)) = network.settlement() else {
                tracing::info!("{} settlement disabled (verification only)", network.network);
                continue;
            };
            let client = EthersChainClient::new(
                network.network,
                rpc_url,
                private_key,
                contract,
                network.explorer_url.clone(),
            )
            .await?;
            chains.insert(network.network, Arc::new(client));
        }

        Ok(Self::new(config, store, chains))
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::get_stats))
        .route("/supported", get(handlers::supported))
        .route("/deferred/verify", post(handlers::verify_voucher))
        .route("/deferred/settle", post(handlers::settle_vouchers))
        .route("/deferred/balance/:payee", get(handlers::get_balance))
        .with_state(ctx)
}
