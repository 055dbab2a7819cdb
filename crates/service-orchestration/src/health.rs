//! Health monitoring for running services
//!
//! One probe loop per running service. Probe results are debounced: a
//! configurable number of consecutive failures flips a service to
//! unhealthy, a single success flips it back.

use async_trait::async_trait;
use chrono::Utc;
use process_launcher::resident_memory;
use serde::{Deserialize, Serialize};
use service_registry::{
    HealthStatus, Registry, ServiceCell, ServiceId, Status, UptimeEvent, UptimeEventKind,
};
use smol::Task;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::uptime::UptimeTracker;
use crate::{Error, Result};

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// 2xx response
    Healthy,
    /// The endpoint answered with a failure status
    Unhealthy(String),
    /// The endpoint could not be reached in time
    Unreachable(String),
}

impl ProbeOutcome {
    /// Whether the probe passed
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// Issues a single health probe
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `url`, giving up after `timeout`
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}

/// HTTP GET prober; any 2xx status is healthy
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProber;

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let url = url.to_string();
        smol::unblock(move || {
            let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
                Ok(client) => client,
                Err(e) => return ProbeOutcome::Unreachable(e.to_string()),
            };
            match client.get(&url).send() {
                Ok(resp) if resp.status().is_success() => ProbeOutcome::Healthy,
                Ok(resp) => ProbeOutcome::Unhealthy(format!("HTTP {}", resp.status())),
                Err(e) => ProbeOutcome::Unreachable(e.to_string()),
            }
        })
        .await
    }
}

/// Probe loop tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    /// Time between probes
    pub interval: Duration,
    /// Per-probe timeout
    pub timeout: Duration,
    /// Consecutive failures before flipping to unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

#[derive(Clone)]
struct ProbeContext {
    registry: Arc<Registry>,
    tracker: Arc<UptimeTracker>,
    prober: Arc<dyn Prober>,
    settings: HealthSettings,
}

impl ProbeContext {
    fn refresh_metrics(&self, cell: &ServiceCell) {
        let state = cell.state();
        let now = Utc::now();
        let memory = state.pid.and_then(resident_memory);
        let uptime = state
            .started_at
            .map(|at| (now - at).num_seconds().max(0) as u64);
        cell.with_state(|s| {
            s.metrics.memory_bytes = memory;
            s.metrics.uptime_secs = uptime;
            s.metrics.sampled_at = Some(now);
        });
    }

    /// Fold a probe result into the debounced health and report any flip
    async fn apply(&self, cell: &ServiceCell, outcome: &ProbeOutcome) -> HealthStatus {
        let threshold = self.settings.failure_threshold.max(1);
        let flip = cell.with_state(|s| {
            if s.status != Status::Running {
                return None;
            }
            if outcome.is_healthy() {
                s.consecutive_failures = 0;
                (s.health != HealthStatus::Healthy).then_some(HealthStatus::Healthy)
            } else {
                s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                (s.consecutive_failures >= threshold && s.health != HealthStatus::Unhealthy)
                    .then_some(HealthStatus::Unhealthy)
            }
        });

        if let Some(health) = flip {
            self.flip(cell, health).await;
        } else if let ProbeOutcome::Unhealthy(reason) | ProbeOutcome::Unreachable(reason) = outcome
        {
            debug!("Probe of {} failed: {}", cell.name(), reason);
        }
        cell.health()
    }

    async fn flip(&self, cell: &ServiceCell, health: HealthStatus) {
        if self.registry.set_health(cell, health).is_none() {
            return;
        }
        let kind = match health {
            HealthStatus::Healthy => {
                // Only a probe-confirmed recovery refunds the restart budget
                if cell.definition().health_url.is_some() {
                    cell.with_state(|s| s.restart_attempts = 0);
                }
                info!("Service {} ({}) is healthy", cell.name(), cell.id());
                UptimeEventKind::Healthy
            }
            HealthStatus::Unhealthy => {
                warn!("Service {} ({}) is unhealthy", cell.name(), cell.id());
                UptimeEventKind::Unhealthy
            }
            HealthStatus::Unknown => return,
        };
        self.tracker.record(UptimeEvent::now(cell.id(), kind)).await;
    }

    async fn run(self, cell: Arc<ServiceCell>) {
        debug!("Probe loop for {} started", cell.name());
        loop {
            if cell.status() != Status::Running {
                break;
            }
            self.refresh_metrics(&cell);
            if let Some(url) = cell.definition().health_url.clone() {
                let outcome = self.prober.probe(&url, self.settings.timeout).await;
                self.apply(&cell, &outcome).await;
            }
            smol::Timer::after(self.settings.interval).await;
        }
        debug!("Probe loop for {} exited", cell.name());
    }
}

/// Owns the probe loops of all running services
pub struct HealthMonitor {
    ctx: ProbeContext,
    loops: Mutex<HashMap<ServiceId, Task<()>>>,
}

impl HealthMonitor {
    /// Create a monitor reporting into `registry` and `tracker`
    pub fn new(
        registry: Arc<Registry>,
        tracker: Arc<UptimeTracker>,
        prober: Arc<dyn Prober>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            ctx: ProbeContext {
                registry,
                tracker,
                prober,
                settings,
            },
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Start the probe loop for a running service, replacing any previous one.
    ///
    /// A service without a health URL is marked healthy straight away.
    pub async fn register(&self, cell: Arc<ServiceCell>) {
        if cell.definition().health_url.is_none() && cell.status() == Status::Running {
            self.ctx.flip(&cell, HealthStatus::Healthy).await;
        }
        let task = smol::spawn(self.ctx.clone().run(cell.clone()));
        let previous = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cell.id(), task);
        drop(previous);
        debug!("Health monitoring registered for {}", cell.name());
    }

    /// Stop probing a service
    pub fn deregister(&self, id: ServiceId) -> bool {
        let task = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        task.is_some()
    }

    /// Stop every probe loop
    pub fn cancel_all(&self) -> usize {
        let loops: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let count = loops.len();
        drop(loops);
        debug!("Cancelled {} probe loop(s)", count);
        count
    }

    /// Services with a live probe loop
    pub fn active(&self) -> usize {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Probe a running service immediately, outside its loop
    pub async fn check_now(&self, cell: &ServiceCell) -> Result<HealthStatus> {
        if cell.status() != Status::Running {
            return Err(Error::HealthProbe(format!(
                "{} is {}, not running",
                cell.name(),
                cell.status()
            )));
        }
        self.ctx.refresh_metrics(cell);
        match cell.definition().health_url.clone() {
            Some(url) => {
                let outcome = self.ctx.prober.probe(&url, self.ctx.settings.timeout).await;
                Ok(self.ctx.apply(cell, &outcome).await)
            }
            None => {
                self.ctx.flip(cell, HealthStatus::Healthy).await;
                Ok(cell.health())
            }
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("settings", &self.ctx.settings)
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_registry::{BuildSystem, Service};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Switch(AtomicBool);

    #[async_trait]
    impl Prober for Switch {
        async fn probe(&self, _url: &str, _timeout: Duration) -> ProbeOutcome {
            if self.0.load(Ordering::SeqCst) {
                ProbeOutcome::Healthy
            } else {
                ProbeOutcome::Unreachable("connection refused".into())
            }
        }
    }

    async fn running(registry: &Registry, url: Option<&str>) -> Arc<ServiceCell> {
        let mut service = Service::new("api", "api", BuildSystem::Npm);
        service.health_url = url.map(String::from);
        let cell = registry.add_service(service).await.unwrap();
        registry.set_status(&cell, Status::Starting, Some(4242)).unwrap();
        registry.set_status(&cell, Status::Running, None).unwrap();
        cell
    }

    fn monitor(registry: Arc<Registry>, tracker: Arc<UptimeTracker>, up: bool) -> (HealthMonitor, Arc<Switch>) {
        let switch = Arc::new(Switch(AtomicBool::new(up)));
        let monitor = HealthMonitor::new(
            registry,
            tracker,
            switch.clone(),
            HealthSettings {
                interval: Duration::from_secs(60),
                timeout: Duration::from_millis(100),
                failure_threshold: 3,
            },
        );
        (monitor, switch)
    }

    #[smol_potat::test]
    async fn test_debounce_needs_threshold_failures() {
        let registry = Arc::new(Registry::in_memory());
        let tracker = Arc::new(UptimeTracker::new(100));
        let cell = running(&registry, Some("http://localhost:1/health")).await;
        let (monitor, switch) = monitor(registry.clone(), tracker.clone(), true);

        assert_eq!(monitor.check_now(&cell).await.unwrap(), HealthStatus::Healthy);

        switch.0.store(false, Ordering::SeqCst);
        assert_eq!(monitor.check_now(&cell).await.unwrap(), HealthStatus::Healthy);
        assert_eq!(monitor.check_now(&cell).await.unwrap(), HealthStatus::Healthy);
        assert_eq!(monitor.check_now(&cell).await.unwrap(), HealthStatus::Unhealthy);

        switch.0.store(true, Ordering::SeqCst);
        assert_eq!(monitor.check_now(&cell).await.unwrap(), HealthStatus::Healthy);

        let kinds: Vec<_> = tracker.events(cell.id()).iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                UptimeEventKind::Healthy,
                UptimeEventKind::Unhealthy,
                UptimeEventKind::Healthy
            ]
        );
    }

    #[smol_potat::test]
    async fn test_no_url_is_healthy_once_running() {
        let registry = Arc::new(Registry::in_memory());
        let tracker = Arc::new(UptimeTracker::new(100));
        let cell = running(&registry, None).await;
        let (monitor, _) = monitor(registry.clone(), tracker.clone(), false);

        monitor.register(cell.clone()).await;
        assert_eq!(cell.health(), HealthStatus::Healthy);
        assert!(monitor.deregister(cell.id()));
        assert!(!monitor.deregister(cell.id()));
    }

    #[smol_potat::test]
    async fn test_stopped_service_refuses_probe() {
        let registry = Arc::new(Registry::in_memory());
        let tracker = Arc::new(UptimeTracker::new(100));
        let cell = running(&registry, Some("http://localhost:1/health")).await;
        let (monitor, _) = monitor(registry.clone(), tracker, true);

        monitor.register(cell.clone()).await;
        registry.set_status(&cell, Status::Stopping, None).unwrap();
        registry.set_status(&cell, Status::Stopped, None).unwrap();

        assert!(matches!(
            monitor.check_now(&cell).await,
            Err(Error::HealthProbe(_))
        ));
        assert_eq!(monitor.cancel_all(), 1);
    }
}
