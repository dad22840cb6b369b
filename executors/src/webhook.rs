//! Outcome notification over HTTP webhooks, HMAC-signed. Delivery retries
//! with exponential backoff inside its own queue and never feeds back into
//! verification.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dvmq::error::QueueError;
use dvmq::job::{JobError, JobOptions, JobResult, RequeuePosition, ToJobResult};
use dvmq::{BorrowedJob, DurableExecution, Queue};
use verifier_core::donation::VerificationOutcome;

const SIGNATURE_HEADER_NAME: &str = "x-signature-sha256";
const TIMESTAMP_HEADER_NAME: &str = "x-request-timestamp";

#[derive(Clone, Debug)]
pub struct WebhookRetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for WebhookRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

pub struct WebhookJobHandler {
    pub http_client: reqwest::Client,
    pub retry_config: Arc<WebhookRetryConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebhookJobPayload {
    pub url: String,
    /// Pre-serialized JSON body.
    pub body: String,
    pub hmac_secret: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WebhookJobOutput {
    pub status_code: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(tag = "errorCode", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookError {
    #[error("Network error during webhook dispatch: {0}")]
    Network(String),

    #[error("Failed to construct webhook request: {0}")]
    RequestConstruction(String),

    #[error("HMAC signature generation failed: {0}")]
    HmacGeneration(String),

    #[error("HTTP {0} from webhook endpoint")]
    Http(u16),

    #[error("Gave up after {0} attempts")]
    RetriesExhausted(u32),
}

impl DurableExecution for WebhookJobHandler {
    type Output = WebhookJobOutput;
    type ErrorData = WebhookError;
    type JobData = WebhookJobPayload;

    #[tracing::instrument(skip_all, fields(queue = "webhook", job_id = %job.job.id))]
    async fn process(
        &self,
        job: &BorrowedJob<Self::JobData>,
    ) -> JobResult<Self::Output, Self::ErrorData> {
        let payload = &job.job.data;

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );

        if let Some(secret) = &payload.hmac_secret {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| {
                    WebhookError::RequestConstruction(format!("System clock error: {e}"))
                })
                .fail_err()?
                .as_secs()
                .to_string();

            // Signed message is "timestamp.body" so replays are detectable.
            let signature = sign(secret, &format!("{timestamp}.{}", payload.body)).fail_err()?;

            headers.insert(
                HeaderName::from_static(SIGNATURE_HEADER_NAME),
                HeaderValue::from_str(&signature)
                    .map_err(|e| {
                        WebhookError::RequestConstruction(format!("Bad signature header: {e}"))
                    })
                    .fail_err()?,
            );
            headers.insert(
                HeaderName::from_static(TIMESTAMP_HEADER_NAME),
                HeaderValue::from_str(&timestamp)
                    .map_err(|e| {
                        WebhookError::RequestConstruction(format!("Bad timestamp header: {e}"))
                    })
                    .fail_err()?,
            );
        }

        debug!(url = %payload.url, attempt = job.job.attempts, "Sending webhook request");

        let response = self
            .http_client
            .post(&payload.url)
            .headers(headers)
            .body(payload.body.clone())
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    info!(status = status.as_u16(), "Webhook delivered");
                    return Ok(WebhookJobOutput {
                        status_code: status.as_u16(),
                    });
                }

                let error = WebhookError::Http(status.as_u16());
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    self.retry_or_give_up(job, error)
                } else {
                    // 4xx endpoints reject the payload itself; retrying
                    // cannot help.
                    Err(JobError::Fail(error))
                }
            }
            Err(e) => self.retry_or_give_up(job, WebhookError::Network(e.to_string())),
        }
    }
}

impl WebhookJobHandler {
    fn retry_or_give_up(
        &self,
        job: &BorrowedJob<WebhookJobPayload>,
        error: WebhookError,
    ) -> JobResult<WebhookJobOutput, WebhookError> {
        if job.job.attempts >= self.retry_config.max_attempts {
            warn!(attempts = job.job.attempts, %error, "Webhook retries exhausted");
            return Err(JobError::Fail(WebhookError::RetriesExhausted(
                job.job.attempts,
            )));
        }

        let delay_ms = self.retry_config.initial_delay_ms as f64
            * self
                .retry_config
                .backoff_factor
                .powi(job.job.attempts.saturating_sub(1) as i32);
        let delay = Duration::from_millis(delay_ms.min(self.retry_config.max_delay_ms as f64) as u64);

        warn!(
            attempt = job.job.attempts,
            max_attempts = self.retry_config.max_attempts,
            delay_ms = delay.as_millis(),
            %error,
            "Webhook delivery failed, retrying"
        );
        Err(JobError::Nack {
            error,
            delay: Some(delay),
            position: RequeuePosition::Last,
        })
    }
}

fn sign(secret: &str, message: &str) -> Result<String, WebhookError> {
    type HmacSha256 = Hmac<sha2::Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::HmacGeneration(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// What the platform backend receives when a donation reaches a terminal
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationOutcomeEvent {
    pub donation_id: u64,
    #[serde(flatten)]
    pub outcome: VerificationOutcome,
}

/// Handle the verification handler uses to enqueue outcome notifications.
#[derive(Clone)]
pub struct WebhookNotifier {
    pub queue: Arc<Queue<WebhookJobHandler>>,
    pub url: String,
    pub hmac_secret: Option<String>,
}

impl WebhookNotifier {
    pub async fn enqueue_donation_outcome(
        &self,
        donation_id: u64,
        outcome: &VerificationOutcome,
    ) -> Result<(), QueueError> {
        let event = DonationOutcomeEvent {
            donation_id,
            outcome: outcome.clone(),
        };
        let payload = WebhookJobPayload {
            url: self.url.clone(),
            body: serde_json::to_string(&event)?,
            hmac_secret: self.hmac_secret.clone(),
        };
        self.queue.push(JobOptions::new(payload)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_signature_is_stable() {
        let signature = sign("topsecret", "1712250000.{}").unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(signature, sign("topsecret", "1712250000.{}").unwrap());
        assert_ne!(signature, sign("othersecret", "1712250000.{}").unwrap());
    }

    #[test]
    fn outcome_event_serializes_flat() {
        let event = DonationOutcomeEvent {
            donation_id: 7,
            outcome: VerificationOutcome::StillPending,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["donationId"], 7);
        assert_eq!(json["outcome"], "stillPending");
    }
}
