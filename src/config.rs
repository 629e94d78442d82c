use eyre::{eyre, Result};
use std::time::Duration;

/// Runtime settings for the replication controller.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public URL of this node, sent to peers as `from`.
    pub local_url: String,

    /// Upper bound on waiting for a work notification before the loop
    /// ticks anyway.
    pub work_wait: Duration,

    /// An unfiltered pass (failure throttle ignored) happens at least
    /// this often, so deeply failing destinations still get retried.
    pub full_pass_interval: Duration,

    /// Dispose a destination's prefetcher once it has been failing
    /// continuously for this long.
    pub failure_gc_threshold: Duration,

    pub http_timeout: Duration,

    /// Run a single replication pass and exit.
    pub once: bool,

    /// Check every destination every pass, ignoring the persisted
    /// failure throttle. Useful for debugging.
    pub ignore_failure_throttle: bool,
}

impl RelayConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn from_cli(
        local_url: String,
        work_wait_seconds: u64,
        full_pass_seconds: u64,
        failure_gc_seconds: u64,
        http_timeout_seconds: u64,
        once: bool,
        ignore_failure_throttle: bool,
    ) -> Result<Self> {
        let local_url = local_url.trim().trim_end_matches('/').to_string();
        if local_url.is_empty() {
            return Err(eyre!("local url must not be empty"));
        }

        let work_wait = Duration::from_secs(work_wait_seconds.max(1));
        let full_pass_interval = Duration::from_secs(full_pass_seconds.max(1));
        if work_wait > full_pass_interval {
            tracing::warn!(
                work_wait_s = work_wait.as_secs(),
                full_pass_s = full_pass_interval.as_secs(),
                "work wait exceeds the full pass interval; every pass will be a full pass"
            );
        }

        Ok(RelayConfig {
            local_url,
            work_wait,
            full_pass_interval,
            failure_gc_threshold: Duration::from_secs(failure_gc_seconds.max(1)),
            http_timeout: Duration::from_secs(http_timeout_seconds.max(1)),
            once,
            ignore_failure_throttle,
        })
    }
}
