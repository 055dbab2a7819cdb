//! Process supervision
//!
//! Every launched service gets two background tasks: a log pump that moves
//! captured output into the service's ring (and the record store), and an
//! exit watcher that owns the process handle. Exits that no stop requested
//! are reported as crashes.

use async_channel::{Receiver, Sender};
use futures::StreamExt;
use process_launcher::{
    ExitStatus, LocalLauncher, OutputStream, Signal, SignalScope, send_signal,
};
use serde::{Deserialize, Serialize};
use service_registry::{
    RecordStore, Registry, ServiceCell, ServiceId, Status, UptimeEvent, UptimeEventKind,
};
use smol::Task;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::runner::BuildRunner;
use crate::uptime::UptimeTracker;
use crate::{Error, Result};

const KILL_WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(50);

/// How a stop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Needed SIGKILL
    ForceKilled,
    /// Nothing was running
    NotRunning,
}

/// An exit nobody asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashNotice {
    /// The service
    pub service_id: ServiceId,
    /// Pid that exited
    pub pid: u32,
    /// How it exited
    pub status: ExitStatus,
}

/// What is needed to signal and await a tracked process
struct Target {
    pid: u32,
    scope: SignalScope,
    exited: Receiver<ExitStatus>,
}

struct Supervised {
    pid: u32,
    scope: SignalScope,
    exited: Receiver<ExitStatus>,
    _watcher: Task<()>,
}

/// Launches, watches and stops service processes
pub struct Supervisor {
    registry: Arc<Registry>,
    tracker: Arc<UptimeTracker>,
    runner: Arc<dyn BuildRunner>,
    log_store: Option<Arc<dyn RecordStore>>,
    crashes: Sender<CrashNotice>,
    procs: Mutex<HashMap<ServiceId, Supervised>>,
}

impl Supervisor {
    /// Create a supervisor; crash notices arrive on the returned receiver
    pub fn new(
        registry: Arc<Registry>,
        tracker: Arc<UptimeTracker>,
        runner: Arc<dyn BuildRunner>,
        log_store: Option<Arc<dyn RecordStore>>,
    ) -> (Self, Receiver<CrashNotice>) {
        let (crashes, notices) = async_channel::unbounded();
        let supervisor = Self {
            registry,
            tracker,
            runner,
            log_store,
            crashes,
            procs: Mutex::new(HashMap::new()),
        };
        (supervisor, notices)
    }

    /// Launch a service with the merged environment in `work_dir`.
    ///
    /// On spawn failure the service is marked crashed.
    pub async fn start(
        &self,
        cell: &Arc<ServiceCell>,
        env: &BTreeMap<String, String>,
        work_dir: &Path,
    ) -> Result<u32> {
        let definition = cell.definition();
        let mut cmd = self.runner.command(&definition, work_dir)?;
        cmd.current_dir(work_dir).envs(env);
        info!(
            "Starting {} ({}) in {:?}: {}",
            definition.name,
            definition.id,
            work_dir,
            cmd.display()
        );

        let (stream, handle) = match LocalLauncher::new().launch(&cmd) {
            Ok(launched) => launched,
            Err(e) => {
                error!("Failed to spawn {}: {}", definition.name, e);
                if let Err(status_err) = self.registry.set_status(cell, Status::Crashed, None) {
                    warn!("Could not mark {} crashed: {}", definition.name, status_err);
                }
                self.tracker
                    .record(UptimeEvent::now(cell.id(), UptimeEventKind::Crashed))
                    .await;
                return Err(Error::ProcessSpawn {
                    service: definition.name.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let pid = handle.pid();
        let scope = if handle.owns_group() {
            SignalScope::Group
        } else {
            SignalScope::Process
        };
        cell.with_state(|s| s.stop_requested = false);
        // Dropping the handle on error kills the fresh process
        self.registry.set_status(cell, Status::Starting, Some(pid))?;
        self.tracker
            .record(UptimeEvent::now(cell.id(), UptimeEventKind::Started))
            .await;

        self.spawn_log_pump(cell.clone(), stream);

        let (exit_tx, exited) = async_channel::bounded(1);
        let watcher = smol::spawn(watch_exit(
            self.registry.clone(),
            self.tracker.clone(),
            self.crashes.clone(),
            cell.clone(),
            handle,
            exit_tx,
        ));
        self.procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                cell.id(),
                Supervised {
                    pid,
                    scope,
                    exited,
                    _watcher: watcher,
                },
            );

        match self.registry.set_status(cell, Status::Running, None) {
            Ok(_) => info!("Service {} running with pid {}", definition.name, pid),
            // The watcher got there first
            Err(service_registry::Error::InvalidTransition { from, .. }) => {
                warn!("Service {} is {} right after launch", definition.name, from)
            }
            Err(e) => return Err(e.into()),
        }
        Ok(pid)
    }

    fn spawn_log_pump(&self, cell: Arc<ServiceCell>, mut stream: OutputStream) {
        let store = self.log_store.clone();
        smol::spawn(async move {
            while let Some(line) = stream.next().await {
                if let Some(store) = &store {
                    if let Err(e) = store.append_log(cell.id(), &line).await {
                        debug!("Failed to persist log line for {}: {}", cell.name(), e);
                    }
                }
                cell.push_log(line);
            }
        })
        .detach();
    }

    fn target(&self, id: ServiceId) -> Option<Target> {
        self.procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|proc| Target {
                pid: proc.pid,
                scope: proc.scope,
                exited: proc.exited.clone(),
            })
    }

    fn release(&self, id: ServiceId) {
        self.procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    async fn mark_stopped(&self, cell: &ServiceCell) -> Result<()> {
        self.registry.set_status(cell, Status::Stopped, None)?;
        cell.with_state(|s| s.stop_requested = false);
        self.tracker
            .record(UptimeEvent::now(cell.id(), UptimeEventKind::Stopped))
            .await;
        Ok(())
    }

    /// Stop a service: SIGTERM to its group, SIGKILL once `timeout` passes.
    ///
    /// The process stays tracked until it is gone, so a stop that is
    /// abandoned halfway can still be finished by [`Supervisor::force_kill`].
    pub async fn stop(&self, cell: &ServiceCell, timeout: Duration) -> Result<StopOutcome> {
        let name = cell.name();
        let target = self.target(cell.id());

        cell.with_state(|s| s.stop_requested = true);
        match cell.status() {
            Status::Stopped if target.is_none() => {
                cell.with_state(|s| s.stop_requested = false);
                return Ok(StopOutcome::NotRunning);
            }
            Status::Crashed => {
                self.release(cell.id());
                self.mark_stopped(cell).await?;
                debug!("Crashed service {} marked stopped", name);
                return Ok(StopOutcome::NotRunning);
            }
            _ => {}
        }

        match self.registry.set_status(cell, Status::Stopping, None) {
            Ok(_) => {}
            // Exited on its own in the meantime
            Err(service_registry::Error::InvalidTransition { from, .. }) => {
                debug!("Service {} was {} when stop began", name, from)
            }
            Err(e) => return Err(e.into()),
        }

        let (pid, outcome) = match &target {
            Some(target) => {
                info!("Stopping {} (pid {})", name, target.pid);
                (Some(target.pid), terminate(target, timeout).await)
            }
            None => match cell.pid() {
                Some(pid) => {
                    warn!("No handle for {} (pid {}), signalling directly", name, pid);
                    (Some(pid), terminate_unowned(pid, timeout).await)
                }
                None => (None, StopOutcome::NotRunning),
            },
        };

        if let Some(pid) = pid.filter(|pid| Self::is_alive(*pid)) {
            error!("Service {} (pid {}) is still alive after SIGKILL", name, pid);
            return Err(Error::StopFailed { service: name, pid });
        }

        self.release(cell.id());
        self.mark_stopped(cell).await?;
        info!("Service {} stopped ({:?})", name, outcome);
        Ok(outcome)
    }

    /// SIGKILL a service's process without waiting for a graceful exit.
    ///
    /// Returns whether a process had to be killed. Falls back to the
    /// recorded pid when no handle is tracked.
    pub async fn force_kill(&self, cell: &ServiceCell) -> Result<bool> {
        let name = cell.name();
        let state = cell.state();
        let target = self.target(cell.id());

        let pid = match (&target, state.pid) {
            (Some(target), _) if state.status.has_process() => target.pid,
            (None, Some(pid)) if state.status.has_process() => pid,
            _ => {
                self.release(cell.id());
                if state.status == Status::Crashed {
                    self.mark_stopped(cell).await?;
                }
                return Ok(false);
            }
        };

        cell.with_state(|s| s.stop_requested = true);
        warn!("Force killing {} (pid {})", name, pid);
        match &target {
            Some(target) => {
                if let Err(e) = send_signal(pid, Signal::SIGKILL, target.scope) {
                    debug!("SIGKILL to {} failed: {}", pid, e);
                }
                let _ = smol::future::or(async { target.exited.recv().await.ok() }, async {
                    smol::Timer::after(KILL_WAIT).await;
                    None
                })
                .await;
            }
            None => {
                if let Err(e) = send_signal(pid, Signal::SIGKILL, SignalScope::Process) {
                    debug!("SIGKILL to {} failed: {}", pid, e);
                }
                wait_for_exit(pid, KILL_WAIT).await;
            }
        }

        if Self::is_alive(pid) {
            error!("Service {} (pid {}) is still alive after SIGKILL", name, pid);
            return Err(Error::StopFailed { service: name, pid });
        }

        self.release(cell.id());
        self.mark_stopped(cell).await?;
        Ok(true)
    }

    /// Whether the supervisor holds a process for a service
    pub fn is_supervised(&self, id: ServiceId) -> bool {
        self.procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Whether a pid refers to a live process
    pub fn is_alive(pid: u32) -> bool {
        process_launcher::is_alive(pid)
    }

    /// Services with a supervised process
    pub fn supervised(&self) -> Vec<ServiceId> {
        self.procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

async fn terminate(proc: &Target, timeout: Duration) -> StopOutcome {
    if let Err(e) = send_signal(proc.pid, Signal::SIGTERM, proc.scope) {
        debug!("SIGTERM to {} failed: {}", proc.pid, e);
    }
    let exited = smol::future::or(async { proc.exited.recv().await.ok() }, async {
        smol::Timer::after(timeout).await;
        None
    })
    .await;
    if exited.is_some() || proc.exited.is_closed() {
        return StopOutcome::Graceful;
    }

    warn!("Pid {} ignored SIGTERM for {:?}, killing", proc.pid, timeout);
    if let Err(e) = send_signal(proc.pid, Signal::SIGKILL, proc.scope) {
        debug!("SIGKILL to {} failed: {}", proc.pid, e);
    }
    let _ = smol::future::or(async { proc.exited.recv().await.ok() }, async {
        smol::Timer::after(KILL_WAIT).await;
        None
    })
    .await;
    StopOutcome::ForceKilled
}

async fn terminate_unowned(pid: u32, timeout: Duration) -> StopOutcome {
    if send_signal(pid, Signal::SIGTERM, SignalScope::Process).is_err() {
        return StopOutcome::NotRunning;
    }
    if wait_for_exit(pid, timeout).await {
        return StopOutcome::Graceful;
    }
    let _ = send_signal(pid, Signal::SIGKILL, SignalScope::Process);
    wait_for_exit(pid, KILL_WAIT).await;
    StopOutcome::ForceKilled
}

/// Poll until `pid` is gone; false when it outlived `timeout`
async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_launcher::is_alive(pid) {
            return true;
        }
        smol::Timer::after(POLL).await;
    }
    !process_launcher::is_alive(pid)
}

async fn watch_exit(
    registry: Arc<Registry>,
    tracker: Arc<UptimeTracker>,
    crashes: Sender<CrashNotice>,
    cell: Arc<ServiceCell>,
    mut handle: process_launcher::LocalProcessHandle,
    exit_tx: Sender<ExitStatus>,
) {
    let pid = handle.pid();
    let status = match handle.wait().await {
        Ok(status) => status,
        Err(e) => {
            warn!("Waiting on pid {} failed: {}", pid, e);
            ExitStatus {
                code: None,
                signal: None,
            }
        }
    };

    let state = cell.state();
    if !state.stop_requested && state.pid == Some(pid) && state.status.has_process() {
        warn!(
            "Service {} ({}) exited unexpectedly: {}",
            cell.name(),
            cell.id(),
            status
        );
        match registry.set_status(&cell, Status::Crashed, None) {
            Ok(_) => {
                tracker
                    .record(UptimeEvent::now(cell.id(), UptimeEventKind::Crashed))
                    .await;
                let _ = crashes.try_send(CrashNotice {
                    service_id: cell.id(),
                    pid,
                    status,
                });
            }
            Err(e) => debug!("Crash of {} not recorded: {}", cell.name(), e),
        }
    } else {
        debug!("Pid {} of {} exited: {}", pid, cell.name(), status);
    }
    let _ = exit_tx.try_send(status);
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("supervised", &self.supervised().len())
            .finish()
    }
}
