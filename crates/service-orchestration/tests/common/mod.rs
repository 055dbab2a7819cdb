//! Shared doubles and helpers for orchestration integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use service_orchestration::{
    EngineConfig, Orchestrator, PortScanner, ProbeOutcome, Prober, RestartPolicy,
};
use service_registry::{BuildSystem, Service};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound for polling helpers
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Prober answering from a set of healthy URLs
#[derive(Default)]
pub struct FakeProber {
    healthy: Mutex<HashSet<String>>,
}

impl FakeProber {
    pub fn set(&self, url: &str, healthy: bool) {
        let mut set = self.healthy.lock().unwrap();
        if healthy {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, url: &str, _timeout: Duration) -> ProbeOutcome {
        if self.healthy.lock().unwrap().contains(url) {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::Unhealthy("HTTP 503 Service Unavailable".into())
        }
    }
}

/// Scanner returning preset pids per port
#[derive(Default)]
pub struct FakeScanner {
    listeners: Mutex<HashMap<u16, Vec<u32>>>,
}

impl FakeScanner {
    pub fn set(&self, port: u16, pids: Vec<u32>) {
        self.listeners.lock().unwrap().insert(port, pids);
    }

    pub fn clear(&self, port: u16) {
        self.listeners.lock().unwrap().remove(&port);
    }
}

#[async_trait]
impl PortScanner for FakeScanner {
    async fn listeners(&self, port: u16) -> service_orchestration::Result<Vec<u32>> {
        Ok(self
            .listeners
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .unwrap_or_default())
    }
}

/// Settings tuned for fast tests
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        health_interval_ms: 50,
        health_timeout_ms: 50,
        failure_threshold: 1,
        stop_timeout_ms: 2_000,
        dependency_wait_ms: 500,
        dependency_poll_ms: 20,
        shutdown_deadline_ms: 5_000,
        port_kill_grace_ms: 1_000,
        restart: RestartPolicy {
            enabled: true,
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 200,
            multiplier: 2.0,
        },
        ..EngineConfig::default()
    }
}

pub struct TestEngine {
    pub engine: Orchestrator,
    pub prober: Arc<FakeProber>,
    pub scanner: Arc<FakeScanner>,
}

pub fn engine(config: EngineConfig) -> TestEngine {
    let prober = Arc::new(FakeProber::default());
    let scanner = Arc::new(FakeScanner::default());
    let engine = Orchestrator::builder(config)
        .prober(prober.clone())
        .port_scanner(scanner.clone())
        .build()
        .unwrap();
    TestEngine {
        engine,
        prober,
        scanner,
    }
}

/// A service running `script` under `sh -c` in `dir`
pub fn shell(name: &str, dir: &Path, script: &str) -> Service {
    Service::new(
        name,
        dir,
        BuildSystem::Shell {
            command: script.into(),
        },
    )
}

/// Poll `cond` until it holds or the test timeout passes
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + TEST_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        smol::Timer::after(Duration::from_millis(25)).await;
    }
    cond()
}
