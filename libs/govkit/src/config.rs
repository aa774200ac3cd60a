//! Runtime tuning knobs.
//!
//! All fields have serde defaults so a host can deserialize a partial config
//! section (or none at all) and still get a working runtime.

use std::time::Duration;

use serde::Deserialize;

/// Configuration shared by every module runtime the manager creates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovConfig {
    /// Bulkhead permits per module (`P`). `0` rejects every async invocation.
    pub permits: usize,
    /// How long an invocation may wait for a permit (`T_acquire`).
    pub acquire_timeout_ms: u64,
    /// Overall async execution timeout (`T_exec`).
    pub exec_timeout_ms: u64,
    /// Maximum number of superseded instances awaiting drain per module.
    pub max_dying: usize,
    /// Period of the idle-instance cleanup tick.
    pub idle_check_interval_secs: u64,
    /// Delay before still-busy dying instances are destroyed after shutdown.
    /// `0` destroys immediately on shutdown.
    pub force_cleanup_delay_secs: u64,
    /// Bound on waiting for in-flight work to drain during manager shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for GovConfig {
    fn default() -> Self {
        Self {
            permits: 64,
            acquire_timeout_ms: 500,
            exec_timeout_ms: 10_000,
            max_dying: 4,
            idle_check_interval_secs: 5,
            force_cleanup_delay_secs: 30,
            shutdown_timeout_secs: 10,
        }
    }
}

impl GovConfig {
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    #[must_use]
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    #[must_use]
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    #[must_use]
    pub fn force_cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.force_cleanup_delay_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
