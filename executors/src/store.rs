//! Persistence seam for donations. The verification core never owns the
//! donation rows; it reads them and applies at most one terminal transition
//! per donation, guarded optimistically against concurrent writers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use verifier_core::donation::{DonationIntent, DonationStatus, VerificationOutcome};
use verifier_core::error::VerificationError;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreError {
    /// The backing store could not be reached. Always retryable.
    #[error("donation store unavailable: {message}")]
    Unavailable { message: String },

    #[error("donation store rejected the request: {message}")]
    Rejected { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRecord {
    pub intent: DonationIntent,
    pub status: DonationStatus,
    /// Terminal failure reason, persisted for observability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<VerificationError>,
    pub speedup_detected: bool,
}

pub trait DonationStore: Send + Sync + 'static {
    fn load(
        &self,
        donation_id: u64,
    ) -> impl Future<Output = Result<Option<DonationRecord>, StoreError>> + Send;

    /// Applies a terminal outcome only while the donation is still pending.
    /// Returns false when another writer got there first; the caller treats
    /// that as an idempotent no-op.
    fn transition_if_pending(
        &self,
        donation_id: u64,
        outcome: &VerificationOutcome,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Overwrites the stored transaction hash after speedup detection. The
    /// original claim is superseded, never deleted from history.
    fn supersede_transaction_hash(
        &self,
        donation_id: u64,
        hash: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Pending, non-fiat donation ids at least `min_age` old, oldest first.
    fn pending_older_than(
        &self,
        min_age: Duration,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<u64>, StoreError>> + Send;
}

/// Map-backed store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryDonationStore {
    donations: Mutex<HashMap<u64, DonationRecord>>,
}

impl InMemoryDonationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: DonationRecord) {
        self.donations
            .lock()
            .unwrap()
            .insert(record.intent.donation_id, record);
    }

    pub fn get(&self, donation_id: u64) -> Option<DonationRecord> {
        self.donations.lock().unwrap().get(&donation_id).cloned()
    }
}

impl DonationStore for InMemoryDonationStore {
    async fn load(&self, donation_id: u64) -> Result<Option<DonationRecord>, StoreError> {
        Ok(self.donations.lock().unwrap().get(&donation_id).cloned())
    }

    async fn transition_if_pending(
        &self,
        donation_id: u64,
        outcome: &VerificationOutcome,
    ) -> Result<bool, StoreError> {
        let mut donations = self.donations.lock().unwrap();
        let Some(record) = donations.get_mut(&donation_id) else {
            return Ok(false);
        };
        if record.status != DonationStatus::Pending {
            return Ok(false);
        }

        match outcome {
            VerificationOutcome::Verified {
                fact,
                speedup_detected,
            } => {
                record.status = DonationStatus::Verified;
                record.speedup_detected = *speedup_detected;
                record.intent.transaction_id = fact.hash.to_lowercase();
            }
            VerificationOutcome::Failed { reason } => {
                record.status = DonationStatus::Failed;
                record.failure_reason = Some(reason.clone());
            }
            VerificationOutcome::StillPending => {}
        }
        Ok(true)
    }

    async fn supersede_transaction_hash(
        &self,
        donation_id: u64,
        hash: &str,
    ) -> Result<(), StoreError> {
        if let Some(record) = self.donations.lock().unwrap().get_mut(&donation_id) {
            record.intent.transaction_id = hash.to_lowercase();
        }
        Ok(())
    }

    async fn pending_older_than(
        &self,
        min_age: Duration,
        limit: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(min_age).unwrap_or_default();
        let donations = self.donations.lock().unwrap();
        let mut pending: Vec<_> = donations
            .values()
            .filter(|r| r.status == DonationStatus::Pending && r.intent.created_at <= cutoff)
            .map(|r| (r.intent.created_at, r.intent.donation_id))
            .collect();
        pending.sort();
        Ok(pending.into_iter().take(limit).map(|(_, id)| id).collect())
    }
}
