//! Configuration for sync sessions and peers.

use crate::error::{SyncError, SyncResult};
use scopesync_protocol::SyncSetup;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Default number of rows per batch part.
pub const DEFAULT_MAX_ROWS_PER_BATCH_PART: usize = 1000;

/// Default number of concurrent part downloads.
pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 4;

/// What to do when two scope setups disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupConflictPolicy {
    /// End the session cleanly without transferring data.
    Abort,
    /// Fail the session with a setup conflict error.
    #[default]
    Rollback,
    /// Adopt the incoming setup on both sides and continue.
    AutoReconcile,
}

/// What to do when rows fail to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyErrorPolicy {
    /// Record the failures, hold the watermark back and complete the session.
    #[default]
    RecordAndContinue,
    /// Fail the session.
    FailSession,
}

/// Where session-scoped batch parts are kept.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SpoolMode {
    /// Keep parts in memory.
    #[default]
    Memory,
    /// Write parts to a private temporary directory, optionally under the given root.
    Disk(Option<PathBuf>),
}

/// Kind of session to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncType {
    /// Upload local changes, then download remote changes.
    #[default]
    Normal,
    /// Skip upload and download a full snapshot of the remote side.
    Reinitialize,
}

/// Configuration of a client sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed client identity. `None` reuses the persisted one or creates it.
    pub client_id: Option<Uuid>,
    /// Requested setup. `None` accepts the setup the server publishes.
    pub setup: Option<SyncSetup>,
    /// Maximum rows per batch part. Must be greater than zero.
    pub max_rows_per_batch_part: usize,
    /// Maximum concurrent part downloads. Zero means unbounded.
    pub max_parallel_downloads: usize,
    /// Setup conflict handling.
    pub setup_conflict_policy: SetupConflictPolicy,
    /// Row apply failure handling.
    pub apply_error_policy: ApplyErrorPolicy,
    /// Storage for downloaded parts.
    pub spool: SpoolMode,
    /// Retry configuration for transport calls.
    pub retry: RetryConfig,
    /// Timeout of a single transport call.
    pub request_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            client_id: None,
            setup: None,
            max_rows_per_batch_part: DEFAULT_MAX_ROWS_PER_BATCH_PART,
            max_parallel_downloads: DEFAULT_MAX_PARALLEL_DOWNLOADS,
            setup_conflict_policy: SetupConflictPolicy::default(),
            apply_error_policy: ApplyErrorPolicy::default(),
            spool: SpoolMode::default(),
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the client identity.
    pub fn with_client_id(mut self, client_id: Uuid) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Sets the requested setup.
    pub fn with_setup(mut self, setup: SyncSetup) -> Self {
        self.setup = Some(setup);
        self
    }

    /// Sets the batch part size.
    pub fn with_max_rows_per_batch_part(mut self, rows: usize) -> Self {
        self.max_rows_per_batch_part = rows;
        self
    }

    /// Sets the download parallelism.
    pub fn with_max_parallel_downloads(mut self, parallel: usize) -> Self {
        self.max_parallel_downloads = parallel;
        self
    }

    /// Sets the setup conflict policy.
    pub fn with_setup_conflict_policy(mut self, policy: SetupConflictPolicy) -> Self {
        self.setup_conflict_policy = policy;
        self
    }

    /// Sets the apply error policy.
    pub fn with_apply_error_policy(mut self, policy: ApplyErrorPolicy) -> Self {
        self.apply_error_policy = policy;
        self
    }

    /// Sets the spool mode.
    pub fn with_spool(mut self, spool: SpoolMode) -> Self {
        self.spool = spool;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the download concurrency limit for a batch of `parts` parts.
    pub fn download_concurrency(&self, parts: usize) -> usize {
        if self.max_parallel_downloads == 0 {
            parts.max(1)
        } else {
            self.max_parallel_downloads
        }
    }

    /// Checks the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_rows_per_batch_part == 0 {
            return Err(SyncError::Config(
                "max_rows_per_batch_part must be greater than zero".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(SyncError::Config("request_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of the responding peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Setups published per scope name.
    pub setups: BTreeMap<String, SyncSetup>,
    /// Maximum rows per outbound batch part.
    pub max_rows_per_batch_part: usize,
    /// Handling of a published setup that differs from the stored one.
    pub setup_conflict_policy: SetupConflictPolicy,
    /// Storage for outbound batches.
    pub spool: SpoolMode,
    /// Idle time after which a session is dropped.
    pub session_ttl: Duration,
}

impl PeerConfig {
    /// Creates a configuration with no published setups.
    pub fn new() -> Self {
        Self {
            setups: BTreeMap::new(),
            max_rows_per_batch_part: DEFAULT_MAX_ROWS_PER_BATCH_PART,
            setup_conflict_policy: SetupConflictPolicy::default(),
            spool: SpoolMode::default(),
            session_ttl: Duration::from_secs(30 * 60),
        }
    }

    /// Publishes a setup under a scope name.
    pub fn with_setup(mut self, scope_name: impl Into<String>, setup: SyncSetup) -> Self {
        self.setups.insert(scope_name.into(), setup);
        self
    }

    /// Sets the batch part size.
    pub fn with_max_rows_per_batch_part(mut self, rows: usize) -> Self {
        self.max_rows_per_batch_part = rows;
        self
    }

    /// Sets the setup conflict policy.
    pub fn with_setup_conflict_policy(mut self, policy: SetupConflictPolicy) -> Self {
        self.setup_conflict_policy = policy;
        self
    }

    /// Sets the spool mode.
    pub fn with_spool(mut self, spool: SpoolMode) -> Self {
        self.spool = spool;
        self
    }

    /// Sets the session time-to-live.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Checks the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_rows_per_batch_part == 0 {
            return Err(SyncError::Config(
                "max_rows_per_batch_part must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_rows_per_batch_part, 1000);
        assert_eq!(config.max_parallel_downloads, 4);
        assert_eq!(config.setup_conflict_policy, SetupConflictPolicy::Rollback);
        assert_eq!(config.apply_error_policy, ApplyErrorPolicy::RecordAndContinue);
        assert_eq!(config.spool, SpoolMode::Memory);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sync_config_builder() {
        let id = Uuid::new_v4();
        let config = SyncConfig::new()
            .with_client_id(id)
            .with_setup(SyncSetup::new(["Product"]))
            .with_max_rows_per_batch_part(2)
            .with_max_parallel_downloads(8)
            .with_setup_conflict_policy(SetupConflictPolicy::Abort)
            .with_request_timeout(Duration::from_secs(5));

        assert_eq!(config.client_id, Some(id));
        assert_eq!(config.max_rows_per_batch_part, 2);
        assert_eq!(config.max_parallel_downloads, 8);
        assert_eq!(config.setup_conflict_policy, SetupConflictPolicy::Abort);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = SyncConfig::new().with_max_rows_per_batch_part(0);
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
        assert!(PeerConfig::new().with_max_rows_per_batch_part(0).validate().is_err());
    }

    #[test]
    fn zero_parallelism_is_unbounded() {
        let config = SyncConfig::new().with_max_parallel_downloads(0);
        assert_eq!(config.download_concurrency(7), 7);
        assert_eq!(config.download_concurrency(0), 1);
        assert_eq!(SyncConfig::new().download_concurrency(7), 4);
    }

    #[test]
    fn peer_config_publishes_setups() {
        let config = PeerConfig::new()
            .with_setup("main", SyncSetup::new(["Product"]))
            .with_session_ttl(Duration::from_secs(60));
        assert!(config.setups.contains_key("main"));
        assert_eq!(config.session_ttl, Duration::from_secs(60));
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
