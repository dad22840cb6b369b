use std::{fmt::Display, time::Duration};

use nanoid::nanoid;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Where a nacked job re-enters the pending list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RequeuePosition {
    #[serde(rename = "first")]
    First,
    #[serde(rename = "last")]
    Last,
}

impl Display for RequeuePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequeuePosition::First => write!(f, "first"),
            RequeuePosition::Last => write!(f, "last"),
        }
    }
}

pub type JobResult<T, E> = Result<T, JobError<E>>;

/// A processing failure, split into "requeue me" and "never retry".
#[derive(Debug)]
pub enum JobError<E> {
    Nack {
        error: E,
        delay: Option<Duration>,
        position: RequeuePosition,
    },
    Fail(E),
}

pub trait ToJobResult<T, E> {
    fn nack_err(self, delay: Option<Duration>, position: RequeuePosition) -> JobResult<T, E>;
    fn fail_err(self) -> JobResult<T, E>;
}

impl<T, E> ToJobResult<T, E> for Result<T, E> {
    fn nack_err(self, delay: Option<Duration>, position: RequeuePosition) -> JobResult<T, E> {
        self.map_err(|e| JobError::Nack {
            error: e,
            delay,
            position,
        })
    }

    fn fail_err(self) -> JobResult<T, E> {
        self.map_err(JobError::Fail)
    }
}

pub trait ToJobError<E> {
    fn nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobError<E>;
    fn fail(self) -> JobError<E>;
}

impl<E> ToJobError<E> for E {
    fn nack(self, delay: Option<Duration>, position: RequeuePosition) -> JobError<E> {
        JobError::Nack {
            error: self,
            delay,
            position,
        }
    }

    fn fail(self) -> JobError<E> {
        JobError::Fail(self)
    }
}

/// Error entry persisted per attempt on a job's error list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorRecord<E> {
    pub error: E,
    pub attempt: u32,
    pub terminal: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<T: Clone> {
    pub id: String,
    pub data: T,
    pub attempts: u32,
    pub created_at: u64,
    pub processed_at: Option<u64>,
    pub finished_at: Option<u64>,
}

/// A job popped from the queue together with the lease token guarding its
/// completion. The lease expires if the worker crashes, making the job
/// visible again.
#[derive(Debug, Clone)]
pub struct BorrowedJob<T: Clone> {
    pub job: Job<T>,
    pub lease_token: String,
}

impl<T: Clone> BorrowedJob<T> {
    pub fn new(job: Job<T>, lease_token: String) -> Self {
        Self { job, lease_token }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Active,
    Delayed,
    Success,
    Failed,
}

pub struct JobOptions<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub data: T,
    pub id: String,
    pub delay: Option<Duration>,
}

impl<T> JobOptions<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(data: T) -> Self {
        Self {
            data,
            id: nanoid!(),
            delay: None,
        }
    }

    /// Set a custom id. Pushes with an id already known to the queue are
    /// deduplicated.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}
