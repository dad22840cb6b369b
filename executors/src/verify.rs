//! The verification job: drives one donation from `pending` to `verified`
//! or `failed` against actual chain state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use dvmq::job::{JobResult, RequeuePosition, ToJobError};
use dvmq::{BorrowedJob, DurableExecution, Queue, SuccessHookData};
use verifier_chains::validate::validate;
use verifier_chains::TransactionResolver;
use verifier_core::donation::{same_address, VerificationOutcome};
use verifier_core::error::VerificationError;

use crate::store::{DonationRecord, DonationStore, StoreError};
use crate::webhook::WebhookNotifier;

/// Pending donations older than this log at error level so an operator
/// looks at why chain confirmation is not arriving.
pub const DEFAULT_STALE_PENDING_AGE: Duration = Duration::from_secs(20 * 60);

const STORE_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationJobData {
    pub donation_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationJobResult {
    pub donation_id: u64,
    /// None when the donation was already terminal (idempotent no-op).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<VerificationOutcome>,
    pub transitioned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationJobError {
    #[error("donation {donation_id} does not exist")]
    DonationNotFound { donation_id: u64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("verification error: {0}")]
    Verification(#[from] VerificationError),
}

pub struct VerificationJobHandler<S, R>
where
    S: DonationStore,
    R: TransactionResolver + 'static,
{
    pub store: Arc<S>,
    pub resolver: Arc<R>,
    pub notifier: Option<WebhookNotifier>,
    pub stale_pending_age: Duration,
}

impl<S, R> VerificationJobHandler<S, R>
where
    S: DonationStore,
    R: TransactionResolver + 'static,
{
    pub fn new(store: Arc<S>, resolver: Arc<R>) -> Self {
        Self {
            store,
            resolver,
            notifier: None,
            stale_pending_age: DEFAULT_STALE_PENDING_AGE,
        }
    }

    pub fn with_notifier(mut self, notifier: WebhookNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    async fn apply_outcome(
        &self,
        donation_id: u64,
        outcome: VerificationOutcome,
    ) -> JobResult<VerificationJobResult, VerificationJobError> {
        let transitioned = self
            .store
            .transition_if_pending(donation_id, &outcome)
            .await
            .map_err(|e| {
                VerificationJobError::from(e)
                    .nack(Some(STORE_RETRY_DELAY), RequeuePosition::Last)
            })?;

        if !transitioned {
            debug!(donation_id, "Lost the transition race, treating as no-op");
        }

        Ok(VerificationJobResult {
            donation_id,
            outcome: Some(outcome),
            transitioned,
        })
    }

    /// Transient failures leave the donation pending and the job successful,
    /// so the retry cadence is the scan cycle, not queue backoff. Old
    /// pending donations escalate to error logs without changing state.
    fn note_still_pending(&self, record: &DonationRecord, cause: &VerificationError) {
        let age = Utc::now() - record.intent.created_at;
        let donation_id = record.intent.donation_id;

        if age.num_seconds() >= self.stale_pending_age.as_secs() as i64 {
            error!(
                donation_id,
                age_secs = age.num_seconds(),
                %cause,
                "Donation stuck in pending beyond the alert threshold"
            );
        } else {
            debug!(donation_id, age_secs = age.num_seconds(), %cause, "Donation still pending");
        }
    }
}

impl<S, R> DurableExecution for VerificationJobHandler<S, R>
where
    S: DonationStore,
    R: TransactionResolver + 'static,
{
    type Output = VerificationJobResult;
    type ErrorData = VerificationJobError;
    type JobData = VerificationJobData;

    #[tracing::instrument(skip_all, fields(queue = "verify", job_id = %job.job.id, donation_id = job.job.data.donation_id))]
    async fn process(
        &self,
        job: &BorrowedJob<Self::JobData>,
    ) -> JobResult<Self::Output, Self::ErrorData> {
        let donation_id = job.job.data.donation_id;

        let record = self
            .store
            .load(donation_id)
            .await
            .map_err(|e| {
                VerificationJobError::from(e)
                    .nack(Some(STORE_RETRY_DELAY), RequeuePosition::Last)
            })?
            .ok_or_else(|| VerificationJobError::DonationNotFound { donation_id }.fail())?;

        if record.status.is_terminal() {
            debug!(donation_id, status = ?record.status, "Donation already terminal");
            return Ok(VerificationJobResult {
                donation_id,
                outcome: None,
                transitioned: false,
            });
        }

        let verification = match self.resolver.resolve(&record.intent).await {
            Ok(fact) => validate(&fact, &record.intent).map(|()| fact),
            Err(e) => Err(e),
        };

        match verification {
            Ok(fact) => {
                let speedup_detected = !record.intent.transaction_id.is_empty()
                    && !same_address(&fact.hash, &record.intent.transaction_id);

                if speedup_detected {
                    info!(
                        donation_id,
                        claimed = %record.intent.transaction_id,
                        mined = %fact.hash,
                        "Speedup detected, superseding stored hash"
                    );
                    self.store
                        .supersede_transaction_hash(donation_id, &fact.hash)
                        .await
                        .map_err(|e| {
                            VerificationJobError::from(e)
                                .nack(Some(STORE_RETRY_DELAY), RequeuePosition::Last)
                        })?;
                }

                self.apply_outcome(
                    donation_id,
                    VerificationOutcome::Verified {
                        fact,
                        speedup_detected,
                    },
                )
                .await
            }
            Err(cause) if cause.is_terminal() => {
                warn!(donation_id, %cause, "Verification failed terminally");
                self.apply_outcome(donation_id, VerificationOutcome::Failed { reason: cause })
                    .await
            }
            Err(cause) => {
                self.note_still_pending(&record, &cause);
                Ok(VerificationJobResult {
                    donation_id,
                    outcome: Some(VerificationOutcome::StillPending),
                    transitioned: false,
                })
            }
        }
    }

    async fn on_success(
        &self,
        job: &BorrowedJob<Self::JobData>,
        d: SuccessHookData<'_, Self::Output>,
    ) {
        // Downstream notification is fire-and-forget; a delivery problem
        // must never look like a verification failure.
        let Some(notifier) = &self.notifier else {
            return;
        };
        let Some(outcome) = &d.result.outcome else {
            return;
        };
        if !d.result.transitioned {
            return;
        }

        if let Err(e) = notifier
            .enqueue_donation_outcome(job.job.data.donation_id, outcome)
            .await
        {
            warn!(
                donation_id = job.job.data.donation_id,
                error = %e,
                "Failed to enqueue outcome notification"
            );
        }
    }
}

/// Pushes one verification job per donation id, keyed by the donation so
/// duplicate enqueues within a cycle collapse.
pub async fn enqueue_verification<S, R>(
    queue: &Queue<VerificationJobHandler<S, R>>,
    donation_id: u64,
) -> Result<(), dvmq::error::QueueError>
where
    S: DonationStore,
    R: TransactionResolver + 'static,
{
    queue
        .push(
            dvmq::job::JobOptions::new(VerificationJobData { donation_id })
                .with_id(format!("donation_{donation_id}")),
        )
        .await?;
    Ok(())
}
