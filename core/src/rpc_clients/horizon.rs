//! Stellar Horizon API client: transaction lookup plus the transaction's
//! operations page, which is where payment/create-account details live.

use chrono::DateTime;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::error::{ReqwestErrorExt, VerificationError};

#[derive(Clone)]
pub struct HorizonClient {
    http: reqwest::Client,
    base_url: Url,
    network_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HorizonTransaction {
    pub hash: String,
    pub successful: bool,
    pub created_at: String,
    #[serde(default)]
    pub memo: Option<String>,
}

impl HorizonTransaction {
    /// `created_at` is RFC 3339; Horizon always emits it in UTC.
    pub fn timestamp_secs(&self) -> Result<u64, VerificationError> {
        let parsed = DateTime::parse_from_rfc3339(&self.created_at).map_err(|e| {
            VerificationError::Rpc {
                network_id: 0,
                message: format!("Unparseable Horizon timestamp {}: {e}", self.created_at),
            }
        })?;
        Ok(parsed.timestamp().max(0) as u64)
    }
}

/// One operation of a transaction. Fields are populated depending on `kind`:
/// `payment` carries from/to/amount, `create_account` carries
/// funder/account/starting_balance.
#[derive(Debug, Clone, Deserialize)]
pub struct HorizonOperation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub asset_type: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub funder: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub starting_balance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HorizonPage<T> {
    #[serde(rename = "_embedded")]
    embedded: HorizonEmbedded<T>,
}

#[derive(Debug, Deserialize)]
struct HorizonEmbedded<T> {
    records: Vec<T>,
}

impl HorizonClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        network_id: u64,
    ) -> Result<Self, VerificationError> {
        let base_url = Url::parse(base_url).map_err(|e| VerificationError::Config {
            message: format!("Invalid Horizon URL {base_url}: {e}"),
        })?;

        Ok(Self {
            http,
            base_url,
            network_id,
        })
    }

    pub async fn get_transaction(
        &self,
        hash: &str,
    ) -> Result<Option<HorizonTransaction>, VerificationError> {
        let url = self.join(&format!("transactions/{hash}"))?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_rpc_error(self.network_id))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let tx = response
            .error_for_status()
            .map_err(|e| e.to_rpc_error(self.network_id))?
            .json()
            .await
            .map_err(|e| e.to_rpc_error(self.network_id))?;

        Ok(Some(tx))
    }

    pub async fn get_operations(
        &self,
        hash: &str,
    ) -> Result<Vec<HorizonOperation>, VerificationError> {
        let mut url = self.join(&format!("transactions/{hash}/operations"))?;
        url.query_pairs_mut().append_pair("limit", "200");

        let page: HorizonPage<HorizonOperation> = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_rpc_error(self.network_id))?
            .error_for_status()
            .map_err(|e| e.to_rpc_error(self.network_id))?
            .json()
            .await
            .map_err(|e| e.to_rpc_error(self.network_id))?;

        Ok(page.embedded.records)
    }

    fn join(&self, path: &str) -> Result<Url, VerificationError> {
        self.base_url
            .join(path)
            .map_err(|e| VerificationError::Config {
                message: format!("Invalid Horizon path {path}: {e}"),
            })
    }
}
