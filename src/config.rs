//! Configuration for the sync pipeline and its worker pool.
//!
//! Use [`SyncConfigBuilder`] to create a configuration with sensible defaults:
//!
//! ```
//! use email_mirror::SyncConfig;
//!
//! let config = SyncConfig::builder()
//!     .workers(8)
//!     .max_attempts(5)
//!     .build()
//!     .expect("valid config");
//! assert_eq!(config.workers, 8);
//! ```

use crate::error::{Error, Result};
use std::time::Duration;

/// Settings shared by every job the orchestrator runs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of concurrent workers pulling from the job queue.
    pub workers: usize,
    /// Envelopes requested per protocol round trip during reconciliation.
    pub batch_size: usize,
    /// Folder size above which per-batch progress events are emitted.
    pub progress_threshold: usize,
    /// Default cap on messages fetched per folder per run (`None` = unbounded).
    pub message_cap: Option<usize>,
    /// Retry and backoff policy for transient job failures.
    pub retry: RetryPolicy,
    /// Wall-clock limits per job attempt.
    pub job_timeouts: JobTimeouts,
    /// Per-call protocol timeouts.
    pub timeouts: TimeoutConfig,
    /// What to do when two jobs target the same account.
    pub conflict_policy: ConflictPolicy,
    /// Delay before a job blocked by a busy account is offered to the pool again.
    pub requeue_delay: Duration,
    /// How long terminal jobs are kept before [`purge_finished`](crate::SyncOrchestrator::purge_finished) removes them.
    pub job_retention: Duration,
    /// How long a job's lease survives without a heartbeat from the
    /// orchestrator that holds its key. Heartbeats are sent every quarter
    /// of this interval; jobs whose lease lapses are treated as interrupted.
    pub lease_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 500,
            progress_threshold: 1000,
            message_cap: Some(5000),
            retry: RetryPolicy::default(),
            job_timeouts: JobTimeouts::default(),
            timeouts: TimeoutConfig::default(),
            conflict_policy: ConflictPolicy::Serialize,
            requeue_delay: Duration::from_millis(500),
            job_retention: Duration::from_secs(7 * 24 * 3600),
            lease_ttl: Duration::from_secs(60),
        }
    }
}

impl SyncConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }
}

/// Timeout configuration for individual protocol calls.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for establishing TCP/TLS connection.
    pub connect: Duration,
    /// Timeout for IMAP authentication.
    pub auth: Duration,
    /// Timeout for listing folders.
    pub list: Duration,
    /// Timeout for examining a folder.
    pub select: Duration,
    /// Timeout for a UID search.
    pub search: Duration,
    /// Timeout for one envelope batch.
    pub envelope_fetch: Duration,
    /// Timeout for fetching one full message.
    pub message_fetch: Duration,
    /// Timeout for logout operation.
    pub logout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            auth: Duration::from_secs(30),
            list: Duration::from_secs(15),
            select: Duration::from_secs(10),
            search: Duration::from_secs(30),
            envelope_fetch: Duration::from_secs(60),
            message_fetch: Duration::from_secs(60),
            logout: Duration::from_secs(5),
        }
    }
}

/// Bounded exponential backoff for transient job failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first run.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Returns `true` if a job that has made `attempts` attempts may run again.
    #[must_use]
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Wall-clock limits for one job attempt.
#[derive(Debug, Clone)]
pub struct JobTimeouts {
    /// After this long a warning is logged and recorded as progress.
    pub soft: Duration,
    /// After this long the attempt is aborted with [`Error::JobTimeout`].
    pub hard: Duration,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(10 * 60),
            hard: Duration::from_secs(30 * 60),
        }
    }
}

/// Policy for concurrent jobs against the same account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Accept the job and run it after the active one finishes.
    Serialize,
    /// Refuse the submission with [`Error::AccountBusy`].
    Reject,
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    workers: Option<usize>,
    batch_size: Option<usize>,
    progress_threshold: Option<usize>,
    message_cap: Option<Option<usize>>,
    retry: Option<RetryPolicy>,
    job_timeouts: Option<JobTimeouts>,
    timeouts: Option<TimeoutConfig>,
    conflict_policy: Option<ConflictPolicy>,
    requeue_delay: Option<Duration>,
    job_retention: Option<Duration>,
    lease_ttl: Option<Duration>,
}

impl SyncConfigBuilder {
    /// Sets the number of concurrent workers.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the envelope batch size.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Sets the folder size above which per-batch progress is reported.
    #[must_use]
    pub fn progress_threshold(mut self, threshold: usize) -> Self {
        self.progress_threshold = Some(threshold);
        self
    }

    /// Sets the default per-folder message cap (`None` disables the cap).
    #[must_use]
    pub fn message_cap(mut self, cap: Option<usize>) -> Self {
        self.message_cap = Some(cap);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the total number of attempts per job.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.retry
            .get_or_insert_with(RetryPolicy::default)
            .max_attempts = attempts;
        self
    }

    /// Sets the base backoff delay.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.retry.get_or_insert_with(RetryPolicy::default).base_delay = delay;
        self
    }

    /// Sets the job wall-clock limits.
    #[must_use]
    pub fn job_timeouts(mut self, timeouts: JobTimeouts) -> Self {
        self.job_timeouts = Some(timeouts);
        self
    }

    /// Sets the per-call protocol timeouts.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Sets the full-message fetch timeout.
    #[must_use]
    pub fn message_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .message_fetch = timeout;
        self
    }

    /// Sets the per-account conflict policy.
    #[must_use]
    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = Some(policy);
        self
    }

    /// Sets the delay before re-offering a job blocked by a busy account.
    #[must_use]
    pub fn requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = Some(delay);
        self
    }

    /// Sets how long terminal jobs are retained.
    #[must_use]
    pub fn job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = Some(retention);
        self
    }

    /// Sets how long a job lease lives without a heartbeat.
    #[must_use]
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a value is out of range.
    pub fn build(self) -> Result<SyncConfig> {
        let defaults = SyncConfig::default();

        let workers = self.workers.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(invalid("workers must be at least 1"));
        }

        let batch_size = self.batch_size.unwrap_or(defaults.batch_size);
        if batch_size == 0 {
            return Err(invalid("batch_size must be at least 1"));
        }

        let retry = self.retry.unwrap_or(defaults.retry);
        if retry.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if retry.base_delay > retry.max_delay {
            return Err(invalid("base_delay must not exceed max_delay"));
        }

        let job_timeouts = self.job_timeouts.unwrap_or(defaults.job_timeouts);
        if job_timeouts.soft > job_timeouts.hard {
            return Err(invalid("soft job timeout must not exceed the hard ceiling"));
        }

        let message_cap = self.message_cap.unwrap_or(defaults.message_cap);
        if message_cap == Some(0) {
            return Err(invalid("message_cap must be at least 1 when set"));
        }

        let lease_ttl = self.lease_ttl.unwrap_or(defaults.lease_ttl);
        if lease_ttl < Duration::from_millis(4) {
            return Err(invalid("lease_ttl must be at least 4ms"));
        }
        if chrono::Duration::from_std(lease_ttl).is_err() {
            return Err(invalid("lease_ttl out of range"));
        }

        Ok(SyncConfig {
            workers,
            batch_size,
            progress_threshold: self.progress_threshold.unwrap_or(defaults.progress_threshold),
            message_cap,
            retry,
            job_timeouts,
            timeouts: self.timeouts.unwrap_or(defaults.timeouts),
            conflict_policy: self.conflict_policy.unwrap_or(defaults.conflict_policy),
            requeue_delay: self.requeue_delay.unwrap_or(defaults.requeue_delay),
            job_retention: self.job_retention.unwrap_or(defaults.job_retention),
            lease_ttl,
        })
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_string(),
    }
}
