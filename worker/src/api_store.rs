//! [`DonationStore`] backed by the donation platform's internal HTTP API.
//! The platform owns the rows; this worker only reads claims and reports
//! outcomes.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use verifier_core::donation::VerificationOutcome;
use verifier_executors::store::{DonationRecord, DonationStore, StoreError};

#[derive(Clone)]
pub struct ApiDonationStore {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutcomeRequest<'a> {
    #[serde(flatten)]
    outcome: &'a VerificationOutcome,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutcomeResponse {
    transitioned: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SupersedeRequest<'a> {
    transaction_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingResponse {
    donation_ids: Vec<u64>,
}

impl ApiDonationStore {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

fn unavailable(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable {
        message: e.to_string(),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_client_error() {
        return Err(StoreError::Rejected {
            message: format!(
                "HTTP {}: {}",
                status.as_u16(),
                response.text().await.unwrap_or_default()
            ),
        });
    }
    response.error_for_status().map_err(unavailable)
}

impl DonationStore for ApiDonationStore {
    async fn load(&self, donation_id: u64) -> Result<Option<DonationRecord>, StoreError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/donations/{donation_id}"))
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let record = check_status(response)
            .await?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(Some(record))
    }

    async fn transition_if_pending(
        &self,
        donation_id: u64,
        outcome: &VerificationOutcome,
    ) -> Result<bool, StoreError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/donations/{donation_id}/outcome"),
            )
            .json(&OutcomeRequest { outcome })
            .send()
            .await
            .map_err(unavailable)?;

        let response: OutcomeResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(response.transitioned)
    }

    async fn supersede_transaction_hash(
        &self,
        donation_id: u64,
        hash: &str,
    ) -> Result<(), StoreError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/donations/{donation_id}/transaction-hash"),
            )
            .json(&SupersedeRequest {
                transaction_id: hash,
            })
            .send()
            .await
            .map_err(unavailable)?;

        check_status(response).await?;
        Ok(())
    }

    async fn pending_older_than(
        &self,
        min_age: Duration,
        limit: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let response = self
            .request(reqwest::Method::GET, "/donations/pending")
            .query(&[
                ("minAgeSecs", min_age.as_secs().to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(unavailable)?;

        let response: PendingResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(response.donation_ids)
    }
}
