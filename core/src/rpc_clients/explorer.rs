//! Etherscan-style block-explorer API client, used by the speedup resolver
//! to page through an address's transaction history. The explorer returns
//! every numeric field as a JSON string.

use serde::{Deserialize, Deserializer};
use url::Url;

use crate::error::{ReqwestErrorExt, VerificationError};

#[derive(Debug, Clone)]
pub struct ExplorerClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    network_id: u64,
}

/// One entry of the explorer's `txlist` result.
#[derive(Debug, Clone, Deserialize)]
pub struct ExplorerTx {
    pub hash: String,
    #[serde(deserialize_with = "string_u64")]
    pub nonce: u64,
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(rename = "timeStamp", deserialize_with = "string_u64")]
    pub time_stamp: u64,
}

#[derive(Debug, Deserialize)]
struct ExplorerEnvelope {
    status: String,
    message: String,
    result: serde_json::Value,
}

impl ExplorerClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        network_id: u64,
    ) -> Result<Self, VerificationError> {
        let base_url = Url::parse(base_url).map_err(|e| VerificationError::Config {
            message: format!("Invalid explorer URL {base_url}: {e}"),
        })?;

        Ok(Self {
            http,
            base_url,
            api_key,
            network_id,
        })
    }

    pub fn network_id(&self) -> u64 {
        self.network_id
    }

    /// One page of the address's transaction history, newest first.
    /// `page` is 1-based.
    pub async fn account_txlist(
        &self,
        address: &str,
        page: u32,
        offset: u32,
    ) -> Result<Vec<ExplorerTx>, VerificationError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("module", "account")
            .append_pair("action", "txlist")
            .append_pair("address", address)
            .append_pair("page", &page.to_string())
            .append_pair("offset", &offset.to_string())
            .append_pair("sort", "desc");
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("apikey", key);
        }

        let envelope: ExplorerEnvelope = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_explorer_error(self.network_id))?
            .error_for_status()
            .map_err(|e| e.to_explorer_error(self.network_id))?
            .json()
            .await
            .map_err(|e| e.to_explorer_error(self.network_id))?;

        if envelope.status != "1" {
            // "No transactions found" is a well-formed empty page, not an
            // API failure.
            if envelope.message.contains("No transactions found") {
                return Ok(Vec::new());
            }
            return Err(VerificationError::Explorer {
                network_id: self.network_id,
                message: format!("{}: {}", envelope.message, envelope.result),
            });
        }

        serde_json::from_value(envelope.result).map_err(|e| VerificationError::Explorer {
            network_id: self.network_id,
            message: format!("Malformed txlist response: {e}"),
        })
    }
}

fn string_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stringly_numeric_txlist_entries() {
        let json = serde_json::json!([{
            "hash": "0x1e8b881a0e0ce35b3ab49a4bb07829a4b30dbd5e28e8a838aee43f2a57a88db5",
            "nonce": "42",
            "from": "0x5ac583feb2b1f288c0a51d6cdca2e8c814bfe93b",
            "to": "0x6e8873085530406995170da467010565968c7c62",
            "timeStamp": "1702925135"
        }]);

        let txs: Vec<ExplorerTx> = serde_json::from_value(json).unwrap();
        assert_eq!(txs[0].nonce, 42);
        assert_eq!(txs[0].time_stamp, 1702925135);
    }
}
