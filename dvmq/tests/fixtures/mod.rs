use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use dvmq::job::{JobError, JobResult, RequeuePosition};
use dvmq::{BorrowedJob, DurableExecution};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TestJobPayload {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestJobOutput {
    pub echoed: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum TestJobError {
    #[error("transient failure")]
    Transient,
    #[error("permanent failure")]
    Permanent,
}

/// Succeeds on every job. Each handler owns its invocation counter so tests
/// running in parallel in the same binary never observe each other.
#[derive(Default)]
pub struct EchoHandler {
    pub processed: Arc<AtomicU32>,
}

impl DurableExecution for EchoHandler {
    type Output = TestJobOutput;
    type ErrorData = TestJobError;
    type JobData = TestJobPayload;

    async fn process(&self, job: &BorrowedJob<Self::JobData>) -> JobResult<Self::Output, Self::ErrorData> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(TestJobOutput {
            echoed: job.job.data.message.clone(),
        })
    }
}

/// Nacks until `succeed_on_attempt`, then succeeds.
#[derive(Default)]
pub struct FlakyHandler {
    pub succeed_on_attempt: u32,
    pub processed: Arc<AtomicU32>,
}

impl DurableExecution for FlakyHandler {
    type Output = TestJobOutput;
    type ErrorData = TestJobError;
    type JobData = TestJobPayload;

    async fn process(&self, job: &BorrowedJob<Self::JobData>) -> JobResult<Self::Output, Self::ErrorData> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if job.job.attempts < self.succeed_on_attempt {
            Err(JobError::Nack {
                error: TestJobError::Transient,
                delay: None,
                position: RequeuePosition::Last,
            })
        } else {
            Ok(TestJobOutput {
                echoed: job.job.data.message.clone(),
            })
        }
    }
}

/// Fails every job permanently.
#[derive(Default)]
pub struct AlwaysFailHandler {
    pub processed: Arc<AtomicU32>,
}

impl DurableExecution for AlwaysFailHandler {
    type Output = TestJobOutput;
    type ErrorData = TestJobError;
    type JobData = TestJobPayload;

    async fn process(&self, _job: &BorrowedJob<Self::JobData>) -> JobResult<Self::Output, Self::ErrorData> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        Err(JobError::Fail(TestJobError::Permanent))
    }
}
