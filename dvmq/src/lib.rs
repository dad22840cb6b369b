//! Redis-backed durable job queue with idempotent job ids, delayed retries
//! and lease-based crash recovery.
//!
//! Jobs are pushed with an id chosen by the caller; pushing an id the queue
//! already knows is a no-op, which is what makes periodic scans safe to
//! re-enqueue work. A popped job carries a lease token with a TTL; if the
//! worker dies, the lease expires and the job returns to pending. When a job
//! finishes (success or permanent failure) its dedupe entry is released so
//! the same id can be enqueued again by a later cycle.

pub mod error;
pub mod job;
pub mod queue;
pub mod shutdown;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::{AsyncCommands, Pipeline, RedisResult, aio::ConnectionManager};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::Instrument;

use error::QueueError;
pub use job::BorrowedJob;
use job::{Job, JobError, JobErrorRecord, JobOptions, JobResult, JobStatus, RequeuePosition};
use queue::QueueOptions;
use shutdown::WorkerHandle;

pub use redis;

pub struct SuccessHookData<'a, O> {
    pub result: &'a O,
}

pub struct NackHookData<'a, E> {
    pub error: &'a E,
    pub delay: Option<Duration>,
    pub position: RequeuePosition,
}

pub struct FailHookData<'a, E> {
    pub error: &'a E,
}

/// A handler that processes jobs of one type. Hooks run after the outcome is
/// decided but before it is committed to Redis; they must not block on the
/// job's own queue.
pub trait DurableExecution: Sized + Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Send + Sync;
    type ErrorData: Serialize + DeserializeOwned + Send + Sync;
    type JobData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn process(
        &self,
        job: &BorrowedJob<Self::JobData>,
    ) -> impl Future<Output = JobResult<Self::Output, Self::ErrorData>> + Send;

    fn on_success(
        &self,
        _job: &BorrowedJob<Self::JobData>,
        _d: SuccessHookData<Self::Output>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn on_nack(
        &self,
        _job: &BorrowedJob<Self::JobData>,
        _d: NackHookData<Self::ErrorData>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn on_fail(
        &self,
        _job: &BorrowedJob<Self::JobData>,
        _d: FailHookData<Self::ErrorData>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}

pub struct Queue<H>
where
    H: DurableExecution,
{
    pub redis: ConnectionManager,
    handler: Arc<H>,
    options: QueueOptions,
    name: String,
}

impl<H: DurableExecution> Queue<H> {
    pub async fn new(
        redis_url: &str,
        name: &str,
        options: Option<QueueOptions>,
        handler: H,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let redis = client.get_connection_manager().await?;

        Ok(Self {
            redis,
            name: name.to_string(),
            options: options.unwrap_or_default(),
            handler: Arc::new(handler),
        })
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pending_list_name(&self) -> String {
        format!("dvmq:{}:pending", self.name)
    }

    pub fn active_hash_name(&self) -> String {
        format!("dvmq:{}:active", self.name)
    }

    pub fn delayed_zset_name(&self) -> String {
        format!("dvmq:{}:delayed", self.name)
    }

    pub fn success_list_name(&self) -> String {
        format!("dvmq:{}:success", self.name)
    }

    pub fn failed_list_name(&self) -> String {
        format!("dvmq:{}:failed", self.name)
    }

    pub fn job_data_hash_name(&self) -> String {
        format!("dvmq:{}:jobs:data", self.name)
    }

    pub fn job_result_hash_name(&self) -> String {
        format!("dvmq:{}:jobs:result", self.name)
    }

    pub fn job_meta_hash_name(&self, job_id: &str) -> String {
        format!("dvmq:{}:job:{}:meta", self.name, job_id)
    }

    pub fn job_errors_list_name(&self, job_id: &str) -> String {
        format!("dvmq:{}:job:{}:errors", self.name, job_id)
    }

    pub fn dedupe_set_name(&self) -> String {
        format!("dvmq:{}:dedup", self.name)
    }

    pub fn lease_key_name(&self, job_id: &str, lease_token: &str) -> String {
        format!("dvmq:{}:job:{}:lease:{}", self.name, job_id, lease_token)
    }

    /// Push a job. Returns the job whether it was newly created or its id
    /// was already present (deduplicated).
    pub async fn push(
        &self,
        job_options: JobOptions<H::JobData>,
    ) -> Result<Job<H::JobData>, QueueError> {
        let script = redis::Script::new(
            r#"
            local job_id = ARGV[1]
            local job_data = ARGV[2]
            local now = tonumber(ARGV[3])
            local delay = tonumber(ARGV[4])

            local delayed_zset_name = KEYS[1]
            local pending_list_name = KEYS[2]
            local job_data_hash_name = KEYS[3]
            local job_meta_hash_name = KEYS[4]
            local dedupe_set_name = KEYS[5]

            if redis.call('SISMEMBER', dedupe_set_name, job_id) == 1 then
                return { 0, job_id }
            end

            redis.call('HSET', job_data_hash_name, job_id, job_data)
            redis.call('HSET', job_meta_hash_name, 'created_at', now)
            redis.call('HSET', job_meta_hash_name, 'attempts', 0)
            redis.call('SADD', dedupe_set_name, job_id)

            if delay > 0 then
                redis.call('ZADD', delayed_zset_name, now + delay, job_id)
            else
                redis.call('RPUSH', pending_list_name, job_id)
            end

            return { 1, job_id }
            "#,
        );

        let now = unix_now();

        let job = Job {
            id: job_options.id.clone(),
            data: job_options.data,
            attempts: 0,
            created_at: now,
            processed_at: None,
            finished_at: None,
        };

        let job_data = serde_json::to_string(&job.data)?;
        let delay_secs = job_options.delay.map(|d| d.as_secs()).unwrap_or(0);

        let (created, _job_id): (i32, String) = script
            .key(self.delayed_zset_name())
            .key(self.pending_list_name())
            .key(self.job_data_hash_name())
            .key(self.job_meta_hash_name(&job.id))
            .key(self.dedupe_set_name())
            .arg(&job.id)
            .arg(job_data)
            .arg(now)
            .arg(delay_secs)
            .invoke_async(&mut self.redis.clone())
            .await?;

        if created == 0 {
            tracing::debug!(job_id = %job.id, queue = %self.name, "Duplicate push ignored");
        }

        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job<H::JobData>>, QueueError> {
        let mut conn = self.redis.clone();
        let data_json: Option<String> = conn.hget(self.job_data_hash_name(), job_id).await?;

        let Some(data_json) = data_json else {
            return Ok(None);
        };
        let data: H::JobData = serde_json::from_str(&data_json)?;

        let meta: std::collections::HashMap<String, String> =
            conn.hgetall(self.job_meta_hash_name(job_id)).await?;

        Ok(Some(Job {
            id: job_id.to_string(),
            data,
            attempts: meta.get("attempts").and_then(|s| s.parse().ok()).unwrap_or(0),
            created_at: meta
                .get("created_at")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            processed_at: meta.get("processed_at").and_then(|s| s.parse().ok()),
            finished_at: meta.get("finished_at").and_then(|s| s.parse().ok()),
        }))
    }

    pub async fn count(&self, status: JobStatus) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();

        let count: usize = match status {
            JobStatus::Pending => conn.llen(self.pending_list_name()).await?,
            JobStatus::Active => conn.hlen(self.active_hash_name()).await?,
            JobStatus::Delayed => conn.zcard(self.delayed_zset_name()).await?,
            JobStatus::Success => conn.llen(self.success_list_name()).await?,
            JobStatus::Failed => conn.llen(self.failed_list_name()).await?,
        };

        Ok(count)
    }

    /// Start the worker loop for this queue. Concurrency is bounded by a
    /// local semaphore; polling also promotes delayed jobs and reclaims
    /// expired leases.
    pub fn work(self: &Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let semaphore = Arc::new(Semaphore::new(self.options.local_concurrency));
        let queue = self.clone();

        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(queue.options.polling_interval);
            tracing::info!(queue = %queue.name(), "Worker started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!(queue = %queue.name(), "Shutdown signal received");
                        break;
                    }

                    _ = interval.tick() => {
                        let available_permits = semaphore.available_permits();
                        if available_permits == 0 && !queue.options.always_poll {
                            continue;
                        }

                        match queue.pop_batch_jobs(available_permits).await {
                            Ok(jobs) => {
                                for job in jobs {
                                    let permit = match semaphore.clone().acquire_owned().await {
                                        Ok(permit) => permit,
                                        Err(_) => break,
                                    };
                                    let queue = queue.clone();
                                    let job_id = job.id().to_string();
                                    let queue_name = queue.name().to_string();

                                    tokio::spawn(async move {
                                        let result = queue.handler.process(&job).await;

                                        if let Err(e) = queue.complete_job(&job, result).await {
                                            tracing::error!(
                                                job_id = %job.id(),
                                                error = ?e,
                                                "Failed to complete job handling"
                                            );
                                        }

                                        drop(permit);
                                    }.instrument(tracing::info_span!("dvmq_worker", %job_id, %queue_name)));
                                }
                            }
                            Err(e) => {
                                tracing::error!(queue = %queue.name(), error = ?e, "Failed to pop jobs");
                                sleep(Duration::from_millis(1000)).await;
                            }
                        }
                    }
                }
            }

            // Graceful shutdown: drain all permits so no job is in flight.
            let _permits: Vec<_> = (0..queue.options.local_concurrency)
                .map(|_| semaphore.clone().acquire_owned())
                .collect::<futures::future::JoinAll<_>>()
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| QueueError::Runtime {
                    message: format!("Failed to acquire permits during shutdown: {e}"),
                })?;

            tracing::info!(queue = %queue.name(), "Worker shutdown complete");
            Ok(())
        });

        WorkerHandle {
            join_handle,
            shutdown_tx,
        }
    }

    /// Atomically: requeue jobs whose lease expired, promote due delayed
    /// jobs, then pop up to `batch_size` jobs with fresh lease keys.
    async fn pop_batch_jobs(
        self: &Arc<Self>,
        batch_size: usize,
    ) -> RedisResult<Vec<BorrowedJob<H::JobData>>> {
        let script = redis::Script::new(
            r#"
            local now = tonumber(ARGV[1])
            local batch_size = tonumber(ARGV[2])
            local lease_seconds = tonumber(ARGV[3])

            local queue_id = KEYS[1]
            local delayed_zset_name = KEYS[2]
            local pending_list_name = KEYS[3]
            local active_hash_name = KEYS[4]
            local job_data_hash_name = KEYS[5]

            local timed_out_jobs = {}

            -- Reclaim jobs whose lease key has expired
            local active_jobs = redis.call('HGETALL', active_hash_name)
            for i = 1, #active_jobs, 2 do
                local job_id = active_jobs[i]
                local job_meta_hash_name = 'dvmq:' .. queue_id .. ':job:' .. job_id .. ':meta'
                local lease_token = redis.call('HGET', job_meta_hash_name, 'lease_token')
                local lease_alive = 0
                if lease_token then
                    local lease_key = 'dvmq:' .. queue_id .. ':job:' .. job_id .. ':lease:' .. lease_token
                    lease_alive = redis.call('EXISTS', lease_key)
                end
                if lease_alive == 0 then
                    redis.call('HDEL', job_meta_hash_name, 'lease_token')
                    redis.call('HDEL', active_hash_name, job_id)
                    redis.call('LPUSH', pending_list_name, job_id)
                    table.insert(timed_out_jobs, job_id)
                end
            end

            -- Promote due delayed jobs
            local due_jobs = redis.call('ZRANGEBYSCORE', delayed_zset_name, 0, now)
            for _, job_id in ipairs(due_jobs) do
                redis.call('ZREM', delayed_zset_name, job_id)
                redis.call('RPUSH', pending_list_name, job_id)
            end

            -- Pop up to batch_size jobs with fresh leases
            local result_jobs = {}
            for i = 1, batch_size do
                local job_id = redis.call('LPOP', pending_list_name)
                if not job_id then
                    break
                end

                local job_data = redis.call('HGET', job_data_hash_name, job_id)
                if job_data then
                    local job_meta_hash_name = 'dvmq:' .. queue_id .. ':job:' .. job_id .. ':meta'
                    redis.call('HSET', job_meta_hash_name, 'processed_at', now)
                    local created_at = redis.call('HGET', job_meta_hash_name, 'created_at') or now
                    local attempts = redis.call('HINCRBY', job_meta_hash_name, 'attempts', 1)

                    local lease_token = now .. '_' .. job_id .. '_' .. attempts
                    local lease_key = 'dvmq:' .. queue_id .. ':job:' .. job_id .. ':lease:' .. lease_token
                    redis.call('SET', lease_key, '1', 'EX', lease_seconds)
                    redis.call('HSET', job_meta_hash_name, 'lease_token', lease_token)
                    redis.call('HSET', active_hash_name, job_id, attempts)

                    table.insert(result_jobs, {job_id, job_data, tostring(attempts), tostring(created_at), lease_token})
                end
            end

            return {result_jobs, timed_out_jobs}
            "#,
        );

        let now = unix_now();

        let (job_results, timed_out_jobs): (
            Vec<(String, String, String, String, String)>,
            Vec<String>,
        ) = script
            .key(self.name())
            .key(self.delayed_zset_name())
            .key(self.pending_list_name())
            .key(self.active_hash_name())
            .key(self.job_data_hash_name())
            .arg(now)
            .arg(batch_size)
            .arg(self.options.lease_duration.as_secs())
            .invoke_async(&mut self.redis.clone())
            .await?;

        for job_id in &timed_out_jobs {
            tracing::warn!(job_id = %job_id, "Job lease expired, moved back to pending");
        }

        let mut jobs = Vec::new();
        for (job_id, data_json, attempts, created_at, lease_token) in job_results {
            match serde_json::from_str::<H::JobData>(&data_json) {
                Ok(data) => {
                    let job = Job {
                        id: job_id,
                        data,
                        attempts: attempts.parse().unwrap_or(1),
                        created_at: created_at.parse().unwrap_or(now),
                        processed_at: Some(now),
                        finished_at: None,
                    };
                    jobs.push(BorrowedJob::new(job, lease_token));
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job_id,
                        error = ?e,
                        "Failed to deserialize job data, moving job to failed"
                    );
                    let queue = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = queue.fail_undecodable_job(&job_id, &lease_token).await {
                            tracing::error!(job_id = %job_id, error = ?e, "Failed to park undecodable job");
                        }
                    });
                }
            }
        }

        Ok(jobs)
    }

    /// Commit a job outcome. The pipeline only applies while the lease is
    /// still held; if the lease lapsed (crash recovery already requeued the
    /// job), the outcome is discarded.
    #[tracing::instrument(level = "debug", skip_all, fields(job_id = job.id(), queue = self.name()))]
    pub async fn complete_job(
        &self,
        job: &BorrowedJob<H::JobData>,
        result: JobResult<H::Output, H::ErrorData>,
    ) -> Result<(), QueueError> {
        let mut pipeline = redis::pipe();

        match &result {
            Ok(output) => {
                self.handler
                    .on_success(job, SuccessHookData { result: output })
                    .await;
                self.add_success_operations(job, output, &mut pipeline)?;
            }
            Err(JobError::Nack {
                error,
                delay,
                position,
            }) => {
                self.handler
                    .on_nack(
                        job,
                        NackHookData {
                            error,
                            delay: *delay,
                            position: *position,
                        },
                    )
                    .await;
                self.add_nack_operations(job, error, *delay, *position, &mut pipeline)?;
            }
            Err(JobError::Fail(error)) => {
                self.handler.on_fail(job, FailHookData { error }).await;
                self.add_fail_operations(job, error, &mut pipeline)?;
            }
        }

        let lease_key = self.lease_key_name(&job.job.id, &job.lease_token);

        loop {
            let mut conn = self.redis.clone();

            redis::cmd("WATCH")
                .arg(&lease_key)
                .query_async::<()>(&mut conn)
                .await?;

            let lease_exists: bool = conn.exists(&lease_key).await?;
            if !lease_exists {
                redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                tracing::warn!(job_id = %job.job.id, "Lease no longer exists, discarding outcome");
                return Ok(());
            }

            let mut atomic_pipeline = pipeline.clone();
            atomic_pipeline.atomic();

            match atomic_pipeline
                .query_async::<Vec<redis::Value>>(&mut conn)
                .await
            {
                Ok(_) => {
                    match &result {
                        Ok(_) => self.prune_finished(self.success_list_name(), self.options.max_success).await?,
                        Err(JobError::Fail(_)) => self.prune_finished(self.failed_list_name(), self.options.max_failed).await?,
                        Err(JobError::Nack { .. }) => {}
                    }
                    return Ok(());
                }
                Err(_) => {
                    // WATCH failed; lease key changed under us, retry.
                    continue;
                }
            }
        }
    }

    fn add_success_operations(
        &self,
        job: &BorrowedJob<H::JobData>,
        result: &H::Output,
        pipeline: &mut Pipeline,
    ) -> Result<(), QueueError> {
        let now = unix_now();

        pipeline
            .del(self.lease_key_name(&job.job.id, &job.lease_token))
            .hdel(self.active_hash_name(), &job.job.id)
            .lpush(self.success_list_name(), &job.job.id)
            .hset(self.job_meta_hash_name(&job.job.id), "finished_at", now)
            .hdel(self.job_meta_hash_name(&job.job.id), "lease_token")
            .srem(self.dedupe_set_name(), &job.job.id);

        let result_json = serde_json::to_string(result)?;
        pipeline.hset(self.job_result_hash_name(), &job.job.id, result_json);

        Ok(())
    }

    fn add_nack_operations(
        &self,
        job: &BorrowedJob<H::JobData>,
        error: &H::ErrorData,
        delay: Option<Duration>,
        position: RequeuePosition,
        pipeline: &mut Pipeline,
    ) -> Result<(), QueueError> {
        let now = unix_now();

        pipeline
            .del(self.lease_key_name(&job.job.id, &job.lease_token))
            .hdel(self.active_hash_name(), &job.job.id)
            .hdel(self.job_meta_hash_name(&job.job.id), "lease_token");

        let record = JobErrorRecord {
            error,
            attempt: job.job.attempts,
            terminal: false,
            created_at: now,
        };
        let error_json = serde_json::to_string(&record)?;
        pipeline.lpush(self.job_errors_list_name(&job.job.id), error_json);

        if let Some(delay) = delay {
            pipeline.zadd(self.delayed_zset_name(), &job.job.id, now + delay.as_secs());
        } else {
            match position {
                RequeuePosition::First => pipeline.lpush(self.pending_list_name(), &job.job.id),
                RequeuePosition::Last => pipeline.rpush(self.pending_list_name(), &job.job.id),
            };
        }

        Ok(())
    }

    fn add_fail_operations(
        &self,
        job: &BorrowedJob<H::JobData>,
        error: &H::ErrorData,
        pipeline: &mut Pipeline,
    ) -> Result<(), QueueError> {
        let now = unix_now();

        pipeline
            .del(self.lease_key_name(&job.job.id, &job.lease_token))
            .hdel(self.active_hash_name(), &job.job.id)
            .lpush(self.failed_list_name(), &job.job.id)
            .hset(self.job_meta_hash_name(&job.job.id), "finished_at", now)
            .hdel(self.job_meta_hash_name(&job.job.id), "lease_token")
            .srem(self.dedupe_set_name(), &job.job.id);

        let record = JobErrorRecord {
            error,
            attempt: job.job.attempts,
            terminal: true,
            created_at: now,
        };
        let error_json = serde_json::to_string(&record)?;
        pipeline.lpush(self.job_errors_list_name(&job.job.id), error_json);

        Ok(())
    }

    /// Trim a finished list to its cap and drop the per-job data of pruned
    /// entries.
    async fn prune_finished(&self, list_name: String, max_len: usize) -> Result<(), QueueError> {
        let script = redis::Script::new(
            r#"
            local queue_id = KEYS[1]
            local list_name = KEYS[2]
            local job_data_hash = KEYS[3]
            local results_hash = KEYS[4]
            local max_len = tonumber(ARGV[1])

            local to_delete = redis.call('LRANGE', list_name, max_len, -1)
            if #to_delete > 0 then
                for _, j_id in ipairs(to_delete) do
                    redis.call('HDEL', job_data_hash, j_id)
                    redis.call('HDEL', results_hash, j_id)
                    redis.call('DEL', 'dvmq:' .. queue_id .. ':job:' .. j_id .. ':meta')
                    redis.call('DEL', 'dvmq:' .. queue_id .. ':job:' .. j_id .. ':errors')
                end
                redis.call('LTRIM', list_name, 0, max_len - 1)
            end
            return #to_delete
            "#,
        );

        let pruned: usize = script
            .key(self.name())
            .key(list_name)
            .key(self.job_data_hash_name())
            .key(self.job_result_hash_name())
            .arg(max_len)
            .invoke_async(&mut self.redis.clone())
            .await?;

        if pruned > 0 {
            tracing::debug!(queue = %self.name(), pruned, "Pruned finished jobs");
        }

        Ok(())
    }

    /// Park a job whose payload can no longer be deserialized. It goes
    /// straight to the failed list; there is nothing to retry.
    async fn fail_undecodable_job(&self, job_id: &str, lease_token: &str) -> Result<(), QueueError> {
        let now = unix_now();
        let mut pipeline = redis::pipe();
        pipeline
            .atomic()
            .del(self.lease_key_name(job_id, lease_token))
            .hdel(self.active_hash_name(), job_id)
            .lpush(self.failed_list_name(), job_id)
            .hset(self.job_meta_hash_name(job_id), "finished_at", now)
            .hdel(self.job_meta_hash_name(job_id), "lease_token")
            .srem(self.dedupe_set_name(), job_id);

        pipeline
            .query_async::<Vec<redis::Value>>(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    pub async fn remove_from_dedupe_set(&self, job_id: &str) -> Result<(), QueueError> {
        self.redis
            .clone()
            .srem::<String, &str, ()>(self.dedupe_set_name(), job_id)
            .await?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
