//! Reclaiming TCP ports held by stray processes
//!
//! Before a service starts, anything still listening on its port (usually a
//! leftover from a previous run) is terminated: SIGTERM first, SIGKILL once
//! the grace period runs out.

use async_trait::async_trait;
use process_launcher::{Command, LocalLauncher, Signal, SignalScope, is_alive, send_signal};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::Result;

static SS_PID: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"pid=(\d+)").ok());

const POLL: Duration = Duration::from_millis(50);
const KILL_CONFIRM: Duration = Duration::from_secs(1);

/// Finds the processes listening on a port
#[async_trait]
pub trait PortScanner: Send + Sync {
    /// Pids with a listening socket on `port`
    async fn listeners(&self, port: u16) -> Result<Vec<u32>>;
}

/// Scanner backed by `lsof`, falling back to `ss` when `lsof` is missing
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortScanner;

impl SystemPortScanner {
    async fn lsof(&self, port: u16) -> Result<Vec<u32>> {
        let mut cmd = Command::new("lsof");
        cmd.args(["-t", "-n", "-P"])
            .arg(format!("-iTCP:{port}"))
            .arg("-sTCP:LISTEN")
            .inherit_process_group();
        let output = LocalLauncher::new().capture(&cmd).await?;
        // lsof exits 1 when nothing matched
        Ok(parse_lsof(&output.stdout))
    }

    async fn ss(&self, port: u16) -> Result<Vec<u32>> {
        let mut cmd = Command::new("ss");
        cmd.arg("-tlnpH")
            .arg(format!("sport = :{port}"))
            .inherit_process_group();
        let output = LocalLauncher::new().capture(&cmd).await?;
        Ok(parse_ss(&output.stdout))
    }
}

#[async_trait]
impl PortScanner for SystemPortScanner {
    async fn listeners(&self, port: u16) -> Result<Vec<u32>> {
        match self.lsof(port).await {
            Ok(pids) => Ok(pids),
            Err(crate::Error::Launcher(process_launcher::Error::CommandNotFound { .. })) => {
                debug!("lsof not available, falling back to ss");
                self.ss(port).await
            }
            Err(e) => Err(e),
        }
    }
}

fn parse_lsof(stdout: &str) -> Vec<u32> {
    let pids: BTreeSet<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.into_iter().collect()
}

fn parse_ss(stdout: &str) -> Vec<u32> {
    let Some(re) = SS_PID.as_ref() else {
        return Vec::new();
    };
    let pids: BTreeSet<u32> = re
        .captures_iter(stdout)
        .filter_map(|caps| caps[1].parse().ok())
        .collect();
    pids.into_iter().collect()
}

/// Whether something is bound to `port` on loopback or the wildcard address
pub fn port_in_use(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_err() || TcpListener::bind(("0.0.0.0", port)).is_err()
}

/// A pid the reclaimer could not get rid of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidError {
    /// The process
    pub pid: u32,
    /// What went wrong
    pub message: String,
}

/// What a cleanup found and did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    /// The port
    pub port: u16,
    /// Processes found listening, excluding the protected pid
    pub found: usize,
    /// Processes confirmed dead
    pub killed: usize,
    /// Pids found, in ascending order
    pub pids: Vec<u32>,
    /// Per-pid failures
    pub errors: Vec<PidError>,
}

impl CleanupResult {
    /// Whether every process found was terminated
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.killed == self.found
    }
}

/// Terminates whatever holds a port
#[derive(Clone)]
pub struct PortReclaimer {
    scanner: Arc<dyn PortScanner>,
    grace: Duration,
}

impl PortReclaimer {
    /// Reclaimer using `scanner`, waiting `grace` between SIGTERM and SIGKILL
    pub fn new(scanner: Arc<dyn PortScanner>, grace: Duration) -> Self {
        Self { scanner, grace }
    }

    /// Terminate every listener on `port` except `exclude_pid` and ourselves.
    ///
    /// Failures are collected per pid; only a failed scan is an error.
    pub async fn cleanup(&self, port: u16, exclude_pid: Option<u32>) -> Result<CleanupResult> {
        let own = std::process::id();
        let pids: Vec<u32> = self
            .scanner
            .listeners(port)
            .await?
            .into_iter()
            .filter(|pid| *pid != own && *pid != 0 && Some(*pid) != exclude_pid)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut result = CleanupResult {
            port,
            found: pids.len(),
            pids: pids.clone(),
            ..Default::default()
        };
        if pids.is_empty() {
            debug!("Port {} has no foreign listeners", port);
            return Ok(result);
        }
        info!("Reclaiming port {} from pid(s) {:?}", port, pids);

        let mut pending = Vec::new();
        for pid in pids {
            match send_signal(pid, Signal::SIGTERM, SignalScope::Process) {
                Ok(()) => pending.push(pid),
                Err(_) if !is_alive(pid) => result.killed += 1,
                Err(e) => result.errors.push(PidError {
                    pid,
                    message: e.to_string(),
                }),
            }
        }

        let terminated = pending.len();
        let pending = wait_for_exit(pending, self.grace).await;
        result.killed += terminated - pending.len();

        if !pending.is_empty() {
            warn!(
                "Pid(s) {:?} ignored SIGTERM on port {}, sending SIGKILL",
                pending, port
            );
            let mut signalled = Vec::new();
            for pid in pending {
                match send_signal(pid, Signal::SIGKILL, SignalScope::Process) {
                    Ok(()) => signalled.push(pid),
                    Err(_) if !is_alive(pid) => result.killed += 1,
                    Err(e) => result.errors.push(PidError {
                        pid,
                        message: e.to_string(),
                    }),
                }
            }
            let survivors = wait_for_exit(signalled.clone(), KILL_CONFIRM).await;
            result.killed += signalled.len() - survivors.len();
            for pid in survivors {
                result.errors.push(PidError {
                    pid,
                    message: "still alive after SIGKILL".into(),
                });
            }
        }

        result.errors.sort_by_key(|e| e.pid);
        info!(
            "Port {} cleanup: found {}, killed {}, {} error(s)",
            port,
            result.found,
            result.killed,
            result.errors.len()
        );
        Ok(result)
    }
}

/// Poll until every pid is gone or `limit` passes; returns the survivors
async fn wait_for_exit(mut pids: Vec<u32>, limit: Duration) -> Vec<u32> {
    let deadline = Instant::now() + limit;
    loop {
        pids.retain(|pid| is_alive(*pid));
        if pids.is_empty() || Instant::now() >= deadline {
            return pids;
        }
        smol::Timer::after(POLL).await;
    }
}

impl std::fmt::Debug for PortReclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortReclaimer")
            .field("grace", &self.grace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof_dedups() {
        assert_eq!(parse_lsof("412\n97\n412\n\n"), vec![97, 412]);
        assert!(parse_lsof("").is_empty());
    }

    #[test]
    fn test_parse_ss_users_column() {
        let out = "LISTEN 0 128 0.0.0.0:8080 0.0.0.0:* users:((\"java\",pid=3311,fd=12),(\"java\",pid=3312,fd=12))\n";
        assert_eq!(parse_ss(out), vec![3311, 3312]);
    }

    #[test]
    fn test_bound_port_is_in_use() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port));
        drop(listener);
    }
}
