//! Periodic scan over pending donations. The queue's idempotent job ids
//! make re-enqueueing the same donation across cycles harmless, so the scan
//! can be dumb and frequent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::{debug, error, info};

use dvmq::Queue;
use verifier_chains::TransactionResolver;

use crate::store::DonationStore;
use crate::verify::{enqueue_verification, VerificationJobHandler};

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How often to look for pending donations.
    pub interval: Duration,
    /// Donations younger than this are skipped; chain confirmation takes at
    /// least a block anyway.
    pub min_donation_age: Duration,
    /// Upper bound per cycle, to keep explorer rate limits honest.
    pub batch_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_donation_age: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

pub struct ScannerHandle {
    join_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

impl ScannerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join_handle.await;
    }
}

/// Spawns the scan loop. Each tick loads a batch of old-enough pending
/// donations and pushes one donation-keyed job per row.
pub fn spawn_pending_scan<S, R>(
    store: Arc<S>,
    queue: Arc<Queue<VerificationJobHandler<S, R>>>,
    config: ScanConfig,
) -> ScannerHandle
where
    S: DonationStore,
    R: TransactionResolver + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let join_handle = tokio::spawn(async move {
        let mut ticker = interval(config.interval);
        info!(
            interval_secs = config.interval.as_secs(),
            batch_size = config.batch_size,
            "Pending donation scan started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Pending donation scan stopping");
                    break;
                }
                _ = ticker.tick() => {
                    run_cycle(&store, &queue, &config).await;
                }
            }
        }
    });

    ScannerHandle {
        join_handle,
        shutdown_tx,
    }
}

async fn run_cycle<S, R>(
    store: &Arc<S>,
    queue: &Arc<Queue<VerificationJobHandler<S, R>>>,
    config: &ScanConfig,
) where
    S: DonationStore,
    R: TransactionResolver + 'static,
{
    let ids = match store
        .pending_older_than(config.min_donation_age, config.batch_size)
        .await
    {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "Pending donation scan could not query the store");
            return;
        }
    };

    if ids.is_empty() {
        return;
    }
    debug!(count = ids.len(), "Enqueueing pending donations");

    for donation_id in ids {
        if let Err(e) = enqueue_verification(queue, donation_id).await {
            error!(donation_id, error = %e, "Failed to enqueue verification job");
        }
    }
}
