//! Engine settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// How `start_all` walks the resolved order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// One service at a time in topological order
    #[default]
    Sequential,
    /// Each dependency tier concurrently, tiers in order
    Tiered,
}

/// Automatic restart after unexpected exits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Whether crashed services are restarted at all
    pub enabled: bool,
    /// Restarts allowed before the service is left crashed
    pub max_retries: u32,
    /// Delay before the first restart
    pub initial_backoff_ms: u64,
    /// Upper bound for the delay
    pub max_backoff_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Tunables for the orchestration engine
///
/// Every field has a default so a stack file only names what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time between health probes of one service
    pub health_interval_ms: u64,
    /// Timeout of a single probe
    pub health_timeout_ms: u64,
    /// Consecutive probe failures before a service is unhealthy
    pub failure_threshold: u32,
    /// Grace period between SIGTERM and SIGKILL on stop
    pub stop_timeout_ms: u64,
    /// Wait for a dependency when its edge sets none
    pub dependency_wait_ms: u64,
    /// Poll interval while waiting for dependencies
    pub dependency_poll_ms: u64,
    /// Upper bound for a whole engine shutdown
    pub shutdown_deadline_ms: u64,
    /// Grace period between SIGTERM and SIGKILL when reclaiming a port
    pub port_kill_grace_ms: u64,
    /// Lines kept in each in-memory log ring
    pub log_capacity: usize,
    /// Uptime events kept per service
    pub uptime_capacity: usize,
    /// Events buffered per subscriber
    pub subscriber_buffer: usize,
    /// Whether captured output is also written to the record store
    pub persist_logs: bool,
    /// Sequential or tiered batch start
    pub batch_mode: BatchMode,
    /// Base for relative service directories
    pub projects_dir: Option<PathBuf>,
    /// Environment applied to every service
    pub env: BTreeMap<String, String>,
    /// Automatic restart settings
    pub restart: RestartPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 5_000,
            health_timeout_ms: 2_000,
            failure_threshold: 3,
            stop_timeout_ms: 10_000,
            dependency_wait_ms: 60_000,
            dependency_poll_ms: 250,
            shutdown_deadline_ms: 30_000,
            port_kill_grace_ms: 3_000,
            log_capacity: 2_000,
            uptime_capacity: 1_000,
            subscriber_buffer: 256,
            persist_logs: true,
            batch_mode: BatchMode::Sequential,
            projects_dir: None,
            env: BTreeMap::new(),
            restart: RestartPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be at least 1".into()));
        }
        if self.health_interval_ms == 0 || self.dependency_poll_ms == 0 {
            return Err(Error::Config(
                "health_interval_ms and dependency_poll_ms must be positive".into(),
            ));
        }
        if self.log_capacity == 0 || self.uptime_capacity == 0 || self.subscriber_buffer == 0 {
            return Err(Error::Config("buffer capacities must be positive".into()));
        }
        if !(self.restart.multiplier.is_finite() && self.restart.multiplier >= 1.0) {
            return Err(Error::Config("restart.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    /// Health probe interval
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    /// Health probe timeout
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Stop grace period
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Default dependency wait
    pub fn dependency_wait(&self) -> Duration {
        Duration::from_millis(self.dependency_wait_ms)
    }

    /// Dependency poll interval
    pub fn dependency_poll(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_ms)
    }

    /// Shutdown deadline
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    /// Port reclaim grace period
    pub fn port_kill_grace(&self) -> Duration {
        Duration::from_millis(self.port_kill_grace_ms)
    }
}
