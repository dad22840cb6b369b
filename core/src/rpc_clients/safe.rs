//! Gnosis Safe transaction service client. Used to map a Safe message hash
//! (the off-chain multisig identifier) to the on-chain execution hash once
//! enough owners have signed and the transaction was executed.

use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::error::{ReqwestErrorExt, VerificationError};

#[derive(Debug, Clone)]
pub struct SafeTransactionServiceClient {
    http: reqwest::Client,
    base_url: Url,
    network_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultisigTransaction {
    #[serde(default)]
    transaction_hash: Option<String>,
}

impl SafeTransactionServiceClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        network_id: u64,
    ) -> Result<Self, VerificationError> {
        let base_url = Url::parse(base_url).map_err(|e| VerificationError::Config {
            message: format!("Invalid Safe transaction service URL {base_url}: {e}"),
        })?;

        Ok(Self {
            http,
            base_url,
            network_id,
        })
    }

    /// Returns the execution hash for a Safe transaction, or `None` when the
    /// service doesn't know the hash yet (not proposed, or not executed).
    pub async fn fetch_safe_tx_hash(
        &self,
        safe_tx_hash: &str,
    ) -> Result<Option<String>, VerificationError> {
        let url = self
            .base_url
            .join(&format!("api/v1/multisig-transactions/{safe_tx_hash}/"))
            .map_err(|e| VerificationError::Config {
                message: format!("Invalid Safe transaction service path: {e}"),
            })?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_explorer_error(self.network_id))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let tx: MultisigTransaction = response
            .error_for_status()
            .map_err(|e| e.to_explorer_error(self.network_id))?
            .json()
            .await
            .map_err(|e| e.to_explorer_error(self.network_id))?;

        Ok(tx.transaction_hash)
    }
}
