use crate::models::{amount::parse_decimal, Network, VoucherDomain};
use anyhow::{bail, Context, Result};
use ethers::types::{Address, U256};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Testnet,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Per-network settings. Verification only needs the token; settlement additionally
/// needs an RPC endpoint, a funded key and the settlement contract.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Network,
    pub token_address: Address,
    pub explorer_url: String,
    pub rpc_url: Option<String>,
    pub private_key: Option<String>,
    pub settlement_contract: Option<Address>,
}

impl NetworkConfig {
    pub fn verification_only(network: Network) -> Result<Self> {
        Ok(Self {
            network,
            token_address: Address::from_str(network.default_token_address())
                .with_context(|| format!("Invalid default token address for {network}"))?,
            explorer_url: network.default_explorer_url().to_string(),
            rpc_url: None,
            private_key: None,
            settlement_contract: None,
        })
    }

    fn from_env(network: Network) -> Result<Self> {
        let prefix = network.env_prefix();
        let mut config = Self::verification_only(network)?;

        if let Some(token) = optional(&format!("{prefix}_TOKEN_ADDRESS")) {
            config.token_address = Address::from_str(&token)
                .with_context(|| format!("Invalid address for {prefix}_TOKEN_ADDRESS"))?;
        }
        if let Some(explorer) = optional(&format!("{prefix}_EXPLORER_URL")) {
            config.explorer_url = explorer.trim_end_matches('/').to_string();
        }
        config.rpc_url = optional(&format!("{prefix}_RPC_URL"));
        config.private_key = optional(&format!("{prefix}_PRIVATE_KEY"));
        config.settlement_contract = optional(&format!("{prefix}_SETTLEMENT_CONTRACT"))
            .map(|addr| {
                Address::from_str(&addr)
                    .with_context(|| format!("Invalid address for {prefix}_SETTLEMENT_CONTRACT"))
            })
            .transpose()?;

        Ok(config)
    }

    pub fn domain(&self) -> VoucherDomain {
        VoucherDomain { chain_id: self.network.chain_id(), token: self.token_address }
    }

    /// RPC URL, key and contract, when all three are configured.
    pub fn settlement(&self) -> Option<(&str, &str, Address)> {
        match (&self.rpc_url, &self.private_key, self.settlement_contract) {
            (Some(rpc), Some(key), Some(contract)) => Some((rpc.as_str(), key.as_str(), contract)),
            _ => None,
        }
    }

    pub fn settlement_enabled(&self) -> bool {
        self.settlement().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub host: String,
    pub port: u16,

    // Storage
    pub store_backend: StoreBackend,
    pub redis_url: String,

    // Deferred scheme
    pub settlement_timeout_secs: u64,
    pub max_voucher_validity_secs: u64,
    pub min_settlement_amount: U256,

    pub networks: Vec<NetworkConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let networks = Network::ALL
            .into_iter()
            .map(NetworkConfig::from_env)
            .collect::<Result<Vec<_>>>()?;

        let config = Self {
            environment: Self::parse_environment()?,
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_var("PORT", "3005")?,

            store_backend: Self::parse_store_backend()?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            settlement_timeout_secs: parse_var("SETTLEMENT_TIMEOUT_SECS", "120")?,
            max_voucher_validity_secs: parse_var("MAX_VOUCHER_VALIDITY_SECS", "3600")?,
            min_settlement_amount: parse_decimal(
                &std::env::var("MIN_SETTLEMENT_AMOUNT").unwrap_or_else(|_| "10000000".to_string()),
            )
            .context("Invalid MIN_SETTLEMENT_AMOUNT")?,

            networks,
        };

        config.validate()?;
        Ok(config)
    }

    fn parse_environment() -> Result<Environment> {
        let env = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        match env.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testnet" | "test" => Ok(Environment::Testnet),
            "production" | "prod" => Ok(Environment::Production),
            _ => bail!("Unknown environment: {}", env),
        }
    }

    fn parse_store_backend() -> Result<StoreBackend> {
        let backend = std::env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            _ => bail!("Unknown STORE_BACKEND: {}", backend),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.settlement_timeout_secs == 0 {
            bail!("SETTLEMENT_TIMEOUT_SECS must be greater than zero");
        }
        if self.store_backend == StoreBackend::Redis && !self.redis_url.starts_with("redis") {
            bail!("REDIS_URL must be a redis:// or rediss:// URL");
        }

        for network in &self.networks {
            let prefix = network.network.env_prefix();
            if let Some(rpc) = &network.rpc_url {
                if !rpc.starts_with("http") {
                    bail!("{}_RPC_URL must be HTTP(S) URL", prefix);
                }
            }
            if let Some(key) = &network.private_key {
                if !key.starts_with("0x") {
                    bail!("{}_PRIVATE_KEY must start with 0x", prefix);
                }
            }
            let partial = network.rpc_url.is_some()
                || network.private_key.is_some()
                || network.settlement_contract.is_some();
            if partial && !network.settlement_enabled() {
                tracing::warn!(
                    "{} settlement disabled: {}_RPC_URL, {}_PRIVATE_KEY and {}_SETTLEMENT_CONTRACT are all required",
                    network.network,
                    prefix,
                    prefix,
                    prefix
                );
            }
        }

        if self.environment == Environment::Production && self.store_backend == StoreBackend::Memory {
            bail!("STORE_BACKEND=memory is not allowed in production");
        }

        tracing::info!(
            "Configuration validated for {:?} environment",
            self.environment
        );

        Ok(())
    }

    /// Signing domains for every known network.
    pub fn domains(&self) -> HashMap<Network, VoucherDomain> {
        self.networks.iter().map(|n| (n.network, n.domain())).collect()
    }

    pub fn settlement_timeout(&self) -> Duration {
        Duration::from_secs(self.settlement_timeout_secs)
    }
}

impl Default for Config {
    /// Development settings with the in-memory store and no settlement networks.
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            host: "127.0.0.1".to_string(),
            port: 3005,
            store_backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            settlement_timeout_secs: 120,
            max_voucher_validity_secs: 3600,
            min_settlement_amount: U256::from(10_000_000u64),
            networks: Network::ALL
                .into_iter()
                .filter_map(|n| NetworkConfig::verification_only(n).ok())
                .collect(),
        }
    }
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(var: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {}", var))
}
