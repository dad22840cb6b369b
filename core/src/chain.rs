//! Per-network chain handles and the registry that owns them.
//!
//! Each chain handle bundles the RPC transport with the auxiliary services
//! the verifier needs for that chain family (block explorer and Safe
//! transaction service on EVM, Horizon on Stellar).

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::providers::{ProviderBuilder, RootProvider};

use crate::constants::{ENTRY_POINT_V06, ENTRY_POINT_V07};
use crate::error::VerificationError;
use crate::rpc_clients::{ExplorerClient, HorizonClient, SafeTransactionServiceClient, SolanaRpcClient};

#[derive(Debug, Clone)]
pub struct EvmChainConfig {
    pub network_id: u64,
    pub rpc_url: String,
    pub explorer_url: Option<String>,
    pub explorer_api_key: Option<String>,
    pub safe_service_url: Option<String>,
    /// EntryPoint contracts beyond the canonical v0.6/v0.7 deployments.
    pub extra_entry_points: Vec<Address>,
    pub native_symbol: String,
}

#[derive(Debug)]
pub struct EvmChain {
    pub network_id: u64,
    pub provider: RootProvider,
    pub explorer: Option<ExplorerClient>,
    pub safe_service: Option<SafeTransactionServiceClient>,
    pub entry_points: Vec<Address>,
    pub native_symbol: String,
}

impl EvmChain {
    pub fn new(config: &EvmChainConfig, http: reqwest::Client) -> Result<Self, VerificationError> {
        let rpc_url = config
            .rpc_url
            .parse()
            .map_err(|e| VerificationError::Config {
                message: format!("Invalid RPC URL for network {}: {e}", config.network_id),
            })?;

        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_http(rpc_url);

        let explorer = match &config.explorer_url {
            Some(url) => Some(ExplorerClient::new(
                http.clone(),
                url,
                config.explorer_api_key.clone(),
                config.network_id,
            )?),
            None => None,
        };

        let safe_service = match &config.safe_service_url {
            Some(url) => Some(SafeTransactionServiceClient::new(
                http.clone(),
                url,
                config.network_id,
            )?),
            None => None,
        };

        let mut entry_points = vec![ENTRY_POINT_V06, ENTRY_POINT_V07];
        entry_points.extend(config.extra_entry_points.iter().copied());

        Ok(Self {
            network_id: config.network_id,
            provider,
            explorer,
            safe_service,
            entry_points,
            native_symbol: config.native_symbol.clone(),
        })
    }

    pub fn is_entry_point(&self, address: Address) -> bool {
        self.entry_points.contains(&address)
    }
}

pub struct SolanaChain {
    pub network_id: u64,
    pub rpc: SolanaRpcClient,
}

pub struct StellarChain {
    pub network_id: u64,
    pub horizon: HorizonClient,
}

/// All networks the verifier knows about, keyed by network id.
#[derive(Default)]
pub struct ChainRegistry {
    evm: HashMap<u64, Arc<EvmChain>>,
    solana: HashMap<u64, Arc<SolanaChain>>,
    stellar: HashMap<u64, Arc<StellarChain>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_evm(&mut self, chain: EvmChain) {
        self.evm.insert(chain.network_id, Arc::new(chain));
    }

    pub fn insert_solana(&mut self, chain: SolanaChain) {
        self.solana.insert(chain.network_id, Arc::new(chain));
    }

    pub fn insert_stellar(&mut self, chain: StellarChain) {
        self.stellar.insert(chain.network_id, Arc::new(chain));
    }

    pub fn get_evm(&self, network_id: u64) -> Result<Arc<EvmChain>, VerificationError> {
        self.evm
            .get(&network_id)
            .cloned()
            .ok_or(VerificationError::Config {
                message: format!("No EVM chain configured for network {network_id}"),
            })
    }

    pub fn get_solana(&self, network_id: u64) -> Result<Arc<SolanaChain>, VerificationError> {
        self.solana
            .get(&network_id)
            .cloned()
            .ok_or(VerificationError::Config {
                message: format!("No Solana chain configured for network {network_id}"),
            })
    }

    pub fn get_stellar(&self, network_id: u64) -> Result<Arc<StellarChain>, VerificationError> {
        self.stellar
            .get(&network_id)
            .cloned()
            .ok_or(VerificationError::Config {
                message: format!("No Stellar chain configured for network {network_id}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_network() {
        let registry = ChainRegistry::new();
        let err = registry.get_evm(42).unwrap_err();
        assert!(matches!(err, VerificationError::Config { .. }));
    }

    #[test]
    fn evm_chain_always_carries_canonical_entry_points() {
        let config = EvmChainConfig {
            network_id: 1,
            rpc_url: "http://localhost:8545".into(),
            explorer_url: None,
            explorer_api_key: None,
            safe_service_url: None,
            extra_entry_points: vec![],
            native_symbol: "ETH".into(),
        };
        let chain = EvmChain::new(&config, reqwest::Client::new()).unwrap();
        assert!(chain.is_entry_point(ENTRY_POINT_V06));
        assert!(chain.is_entry_point(ENTRY_POINT_V07));
    }
}
