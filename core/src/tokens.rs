use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A token the platform accepts on one network. `address` is the ERC-20
/// contract, SPL mint, or Stellar asset issuer depending on the chain
/// family; stored lower-cased.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
}

/// Lookup seam for the externally-owned token table.
pub trait TokenService: Send + Sync {
    fn find_by_symbol(&self, network_id: u64, symbol: &str) -> Option<TokenInfo>;
    fn find_by_address(&self, network_id: u64, address: &str) -> Option<TokenInfo>;
}

/// Registry built once at bootstrap from configuration.
#[derive(Debug, Default)]
pub struct StaticTokenRegistry {
    by_symbol: HashMap<(u64, String), TokenInfo>,
    by_address: HashMap<(u64, String), TokenInfo>,
}

impl StaticTokenRegistry {
    pub fn new(entries: impl IntoIterator<Item = (u64, TokenInfo)>) -> Self {
        let mut registry = Self::default();
        for (network_id, token) in entries {
            registry.insert(network_id, token);
        }
        registry
    }

    pub fn insert(&mut self, network_id: u64, token: TokenInfo) {
        let token = TokenInfo {
            address: token.address.to_lowercase(),
            ..token
        };
        self.by_symbol.insert(
            (network_id, token.symbol.to_uppercase()),
            token.clone(),
        );
        self.by_address
            .insert((network_id, token.address.clone()), token);
    }
}

impl TokenService for StaticTokenRegistry {
    fn find_by_symbol(&self, network_id: u64, symbol: &str) -> Option<TokenInfo> {
        self.by_symbol
            .get(&(network_id, symbol.to_uppercase()))
            .cloned()
    }

    fn find_by_address(&self, network_id: u64, address: &str) -> Option<TokenInfo> {
        self.by_address
            .get(&(network_id, address.to_lowercase()))
            .cloned()
    }
}
