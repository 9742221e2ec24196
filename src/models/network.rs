use crate::error::DeferredError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Networks the facilitator accepts vouchers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    Celo,
    CeloSepolia,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Celo, Network::CeloSepolia];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Celo => "celo",
            Network::CeloSepolia => "celo-sepolia",
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Celo => 42220,
            Network::CeloSepolia => 11142220,
        }
    }

    /// USDC contract the voucher domain is bound to unless overridden in config.
    pub fn default_token_address(&self) -> &'static str {
        match self {
            Network::Celo => "0xcebA9300f2b948710d2653dD7B07f33A8B32118C",
            Network::CeloSepolia => "0x2F25deB3848C207fc8E0c34035B3Ba7fC157602B",
        }
    }

    pub fn default_explorer_url(&self) -> &'static str {
        match self {
            Network::Celo => "https://celoscan.io",
            Network::CeloSepolia => "https://celo-sepolia.blockscout.com",
        }
    }

    /// Prefix used for per-network environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Network::Celo => "CELO",
            Network::CeloSepolia => "CELO_SEPOLIA",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = DeferredError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "celo" => Ok(Network::Celo),
            "celo-sepolia" | "celo_sepolia" => Ok(Network::CeloSepolia),
            other => Err(DeferredError::UnsupportedNetwork(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_round_trips_through_str() {
        for network in Network::ALL {
            assert_eq!(network.as_str().parse::<Network>().unwrap(), network);
        }
    }

    #[test]
    fn test_unknown_network_rejected() {
        let err = "base".parse::<Network>().unwrap_err();
        assert!(matches!(err, DeferredError::UnsupportedNetwork(n) if n == "base"));
    }

    #[test]
    fn test_serde_uses_kebab_case() {
        let json = serde_json::to_string(&Network::CeloSepolia).unwrap();
        assert_eq!(json, "\"celo-sepolia\"");
    }
}
