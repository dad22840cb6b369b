use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::QueueError;

/// Handle to a running worker loop. Dropping it does not stop the worker;
/// call [`WorkerHandle::shutdown`] for a graceful stop that waits for
/// in-flight jobs.
pub struct WorkerHandle {
    pub(crate) join_handle: JoinHandle<Result<(), QueueError>>,
    pub(crate) shutdown_tx: oneshot::Sender<()>,
}

impl WorkerHandle {
    pub async fn shutdown(self) -> Result<(), QueueError> {
        // Worker may already have exited; a send failure just means there is
        // nothing left to signal.
        let _ = self.shutdown_tx.send(());

        match self.join_handle.await {
            Ok(result) => result,
            Err(e) => Err(QueueError::Runtime {
                message: format!("Worker task panicked or was cancelled: {e}"),
            }),
        }
    }

    pub fn abort(&self) {
        self.join_handle.abort();
    }
}
