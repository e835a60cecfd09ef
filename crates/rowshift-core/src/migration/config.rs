//! Migration engine configuration.

use std::time::Duration;

/// Configuration for the scheduler and job tracker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts allowed per job before it fails terminally.
    pub max_attempts: u32,
    /// Lower bound for a definition's pacing interval.
    pub minimum_interval: Duration,
    /// Pacing interval used when an enqueue request sets none.
    pub default_interval: Duration,
    /// Batch size used when an enqueue request sets none.
    pub default_batch_size: u64,
    /// Sub-batch size used when an enqueue request sets none.
    pub default_sub_batch_size: u64,
    /// Wall-clock budget of one batch, checked between sub-batches.
    pub batch_timeout: Duration,
    /// A running job without a heartbeat for this long may be reclaimed.
    pub stale_job_timeout: Duration,
    /// Initial retry backoff; doubles with each attempt.
    pub retry_backoff: Duration,
    /// Upper bound on retry backoff.
    pub max_retry_backoff: Duration,
    /// Sleep while `finalize` waits for jobs held by other workers.
    pub finalize_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            minimum_interval: Duration::from_secs(2),
            default_interval: Duration::from_secs(120),
            default_batch_size: 1000,
            default_sub_batch_size: 100,
            batch_timeout: Duration::from_secs(300),
            stale_job_timeout: Duration::from_secs(3600),
            retry_backoff: Duration::from_secs(10),
            max_retry_backoff: Duration::from_secs(600),
            finalize_poll_interval: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the minimum pacing interval.
    pub fn with_minimum_interval(mut self, interval: Duration) -> Self {
        self.minimum_interval = interval;
        self
    }

    /// Set the default pacing interval.
    pub fn with_default_interval(mut self, interval: Duration) -> Self {
        self.default_interval = interval;
        self
    }

    /// Set default batch and sub-batch sizes.
    pub fn with_default_batch_sizes(mut self, batch_size: u64, sub_batch_size: u64) -> Self {
        self.default_batch_size = batch_size;
        self.default_sub_batch_size = sub_batch_size;
        self
    }

    /// Set the batch timeout.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Set the stale job timeout.
    pub fn with_stale_job_timeout(mut self, timeout: Duration) -> Self {
        self.stale_job_timeout = timeout;
        self
    }

    /// Set retry backoff bounds.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_retry_backoff = max;
        self
    }

    /// Configuration suited to tests: no pacing and no backoff.
    pub fn immediate() -> Self {
        Self {
            minimum_interval: Duration::ZERO,
            default_interval: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            max_retry_backoff: Duration::ZERO,
            finalize_poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    /// Backoff before the attempt following `attempts` failures.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_retry_backoff)
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Sleep between polls when there is nothing to do.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerPoolConfig {
    /// Set the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = EngineConfig::default()
            .with_retry_backoff(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(config.backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for(3), Duration::from_secs(4));
        assert_eq!(config.backoff_for(4), Duration::from_secs(5));
        assert_eq!(config.backoff_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_worker_config_floor() {
        let config = WorkerPoolConfig::default().with_workers(0);
        assert_eq!(config.workers, 1);
        assert_eq!(EngineConfig::default().with_max_attempts(0).max_attempts, 1);
    }
}
