//! Verification job behavior against an in-memory store and a stub
//! resolver: idempotence, speedup superseding, terminal-vs-transient
//! classification.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use dvmq::job::{Job, JobError};
use dvmq::{BorrowedJob, DurableExecution};
use verifier_chains::TransactionResolver;
use verifier_core::donation::{
    ChainType, DonationIntent, DonationStatus, TransactionFact, VerificationOutcome,
};
use verifier_core::error::VerificationError;
use verifier_executors::store::{DonationRecord, DonationStore, InMemoryDonationStore};
use verifier_executors::verify::{VerificationJobData, VerificationJobError, VerificationJobHandler};

struct StubResolver {
    result: Result<TransactionFact, VerificationError>,
    calls: AtomicU32,
}

impl StubResolver {
    fn new(result: Result<TransactionFact, VerificationError>) -> Self {
        Self {
            result,
            calls: AtomicU32::new(0),
        }
    }
}

impl TransactionResolver for StubResolver {
    async fn resolve(
        &self,
        _intent: &DonationIntent,
    ) -> Result<TransactionFact, VerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }

    async fn resolve_batch(
        &self,
        intent: &DonationIntent,
    ) -> Result<Vec<TransactionFact>, VerificationError> {
        Ok(vec![self.resolve(intent).await?])
    }
}

const FROM: &str = "0x6e8873085530406995170da467010565968c7c62";
const TO: &str = "0x5ac583feb2b1f288c0a51d6cdca2e8c814bfe93b";
const CLAIMED_HASH: &str = "0x0f9fd2d02b9a31a0e723ccb9d4cc6e85a685b9c1e291b1e30bf00a2438763afe";

fn intent(donation_id: u64) -> DonationIntent {
    DonationIntent {
        donation_id,
        transaction_id: CLAIMED_HASH.into(),
        safe_transaction_id: None,
        network_id: 1,
        chain_type: ChainType::Evm,
        from_address: FROM.into(),
        to_address: TO.into(),
        amount: 0.04,
        currency: "ETH".into(),
        nonce: None,
        is_swap: false,
        imported: false,
        created_at: Utc::now() - ChronoDuration::minutes(2),
    }
}

fn matching_fact(intent: &DonationIntent) -> TransactionFact {
    TransactionFact {
        hash: intent.transaction_id.clone(),
        from: intent.from_address.clone(),
        to: intent.to_address.clone(),
        amount: intent.amount,
        currency: intent.currency.clone(),
        timestamp_secs: (intent.created_at.timestamp() + 10) as u64,
        nonce: Some(42),
        safe_received_at: Vec::new(),
    }
}

fn pending_record(intent: DonationIntent) -> DonationRecord {
    DonationRecord {
        intent,
        status: DonationStatus::Pending,
        failure_reason: None,
        speedup_detected: false,
    }
}

fn borrowed(donation_id: u64) -> BorrowedJob<VerificationJobData> {
    BorrowedJob::new(
        Job {
            id: format!("donation_{donation_id}"),
            data: VerificationJobData { donation_id },
            attempts: 1,
            created_at: 0,
            processed_at: None,
            finished_at: None,
        },
        "lease".to_string(),
    )
}

fn handler(
    store: Arc<InMemoryDonationStore>,
    resolver: StubResolver,
) -> VerificationJobHandler<InMemoryDonationStore, StubResolver> {
    VerificationJobHandler::new(store, Arc::new(resolver))
}

#[tokio::test]
async fn matching_native_transfer_verifies_without_speedup() {
    let intent = intent(1);
    let fact = matching_fact(&intent);
    let store = Arc::new(InMemoryDonationStore::new());
    store.insert(pending_record(intent));

    let handler = handler(store.clone(), StubResolver::new(Ok(fact.clone())));
    let result = handler.process(&borrowed(1)).await.unwrap();

    assert!(result.transitioned);
    match result.outcome.unwrap() {
        VerificationOutcome::Verified {
            fact: resolved,
            speedup_detected,
        } => {
            assert_eq!(resolved, fact);
            assert!(!speedup_detected);
        }
        other => panic!("expected verified outcome, got {other:?}"),
    }
    assert_eq!(store.get(1).unwrap().status, DonationStatus::Verified);
}

#[tokio::test]
async fn speedup_supersedes_stored_hash() {
    let intent = intent(2);
    let mut fact = matching_fact(&intent);
    fact.hash = "0x30419a3a69e8ed48ba6f2d9302f9004367a6dee229076a413de32cf2ab8759e4".into();
    let store = Arc::new(InMemoryDonationStore::new());
    store.insert(pending_record(intent));

    let handler = handler(store.clone(), StubResolver::new(Ok(fact.clone())));
    let result = handler.process(&borrowed(2)).await.unwrap();

    match result.outcome.unwrap() {
        VerificationOutcome::Verified {
            speedup_detected, ..
        } => assert!(speedup_detected),
        other => panic!("expected verified outcome, got {other:?}"),
    }

    let record = store.get(2).unwrap();
    assert_eq!(record.status, DonationStatus::Verified);
    assert_eq!(record.intent.transaction_id, fact.hash);
    assert!(record.speedup_detected);
}

#[tokio::test]
async fn recipient_mismatch_fails_on_first_attempt() {
    let intent = intent(3);
    let mut fact = matching_fact(&intent);
    fact.to = "0x0000000000000000000000000000000000000001".into();
    let store = Arc::new(InMemoryDonationStore::new());
    store.insert(pending_record(intent));

    let handler = handler(store.clone(), StubResolver::new(Ok(fact)));
    let result = handler.process(&borrowed(3)).await.unwrap();

    assert!(matches!(
        result.outcome,
        Some(VerificationOutcome::Failed {
            reason: VerificationError::ToAddressMismatch { .. }
        })
    ));

    let record = store.get(3).unwrap();
    assert_eq!(record.status, DonationStatus::Failed);
    assert!(matches!(
        record.failure_reason,
        Some(VerificationError::ToAddressMismatch { .. })
    ));
}

#[tokio::test]
async fn transient_resolution_leaves_donation_pending() {
    let store = Arc::new(InMemoryDonationStore::new());
    store.insert(pending_record(intent(4)));

    let handler = handler(store.clone(), StubResolver::new(Err(VerificationError::Pending)));
    let result = handler.process(&borrowed(4)).await.unwrap();

    assert!(matches!(
        result.outcome,
        Some(VerificationOutcome::StillPending)
    ));
    assert!(!result.transitioned);
    assert_eq!(store.get(4).unwrap().status, DonationStatus::Pending);
}

#[tokio::test]
async fn terminal_donation_is_an_idempotent_noop() {
    let store = Arc::new(InMemoryDonationStore::new());
    let mut record = pending_record(intent(5));
    record.status = DonationStatus::Verified;
    store.insert(record);

    let resolver = StubResolver::new(Err(VerificationError::Pending));
    let handler = handler(store.clone(), resolver);

    let result = handler.process(&borrowed(5)).await.unwrap();
    assert!(result.outcome.is_none());
    assert!(!result.transitioned);
    // The resolver is never consulted for terminal donations.
    assert_eq!(handler.resolver.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.get(5).unwrap().status, DonationStatus::Verified);
}

#[tokio::test]
async fn missing_donation_fails_the_job() {
    let store = Arc::new(InMemoryDonationStore::new());
    let handler = handler(store, StubResolver::new(Err(VerificationError::Pending)));

    let result = handler.process(&borrowed(404)).await;
    assert!(matches!(
        result,
        Err(JobError::Fail(VerificationJobError::DonationNotFound {
            donation_id: 404
        }))
    ));
}
