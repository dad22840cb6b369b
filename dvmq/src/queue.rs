use std::time::Duration;

#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub max_success: usize,
    pub max_failed: usize,
    pub lease_duration: Duration,
    /// Maximum number of jobs processed concurrently by this instance.
    pub local_concurrency: usize,
    pub polling_interval: Duration,

    /// If true, poll even when no permits are free. Polling is also how
    /// delayed jobs and expired leases are handled, so a single-node
    /// deployment should keep this on.
    pub always_poll: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_success: 1000,
            max_failed: 10000,
            local_concurrency: 5,
            polling_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(60),
            always_poll: true,
        }
    }
}
