//! Process handles, exit status and pid-level signalling

use async_process::Child;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some()
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// Whether a signal targets one pid or the process group it leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalScope {
    /// Only the given pid
    Process,
    /// Every member of the group whose id equals the pid
    Group,
}

/// Send a signal to a pid or its process group
pub fn send_signal(pid: u32, signal: Signal, scope: SignalScope) -> Result<()> {
    let target = Pid::from_raw(pid as i32);
    let outcome = match scope {
        SignalScope::Process => signal::kill(target, signal),
        SignalScope::Group => signal::killpg(target, signal),
    };
    debug!("Sent {} to {:?} {}", signal, scope, pid);
    outcome.map_err(|e| Error::signal_failed(pid, signal, e.desc()))
}

/// Check whether a pid refers to a live process.
///
/// A process we lack permission to signal still exists, so `EPERM` counts
/// as alive. Zombies awaiting reaping do not.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let exists = match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    };
    exists && !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesised command name
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = stat.rsplit_once(')')?.1;
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

/// Resident set size of a process in bytes, where `/proc` is available
pub fn resident_memory(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// A handle to a locally spawned child process
pub struct LocalProcessHandle {
    child: Child,
    pid: u32,
    own_group: bool,
    kill_on_drop: bool,
    reaped: bool,
}

impl LocalProcessHandle {
    pub(crate) fn new(child: Child, own_group: bool) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            own_group,
            kill_on_drop: true,
            reaped: false,
        }
    }

    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the child leads its own process group
    pub fn owns_group(&self) -> bool {
        self.own_group
    }

    /// Leave the process running when the handle is dropped
    pub fn detach(&mut self) {
        self.kill_on_drop = false;
    }

    fn scope(&self) -> SignalScope {
        if self.own_group {
            SignalScope::Group
        } else {
            SignalScope::Process
        }
    }

    /// Wait for the process to complete and return its exit status
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.status().await?;
        self.reaped = true;
        Ok(status.into())
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let status = self.child.try_status()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status.map(Into::into))
    }

    /// Send an arbitrary signal to the process (or its group)
    pub fn signal(&self, signal: Signal) -> Result<()> {
        send_signal(self.pid, signal, self.scope())
    }

    /// Send SIGTERM for graceful shutdown
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to forcefully stop the process
    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }
}

impl Drop for LocalProcessHandle {
    fn drop(&mut self) {
        if self.kill_on_drop && !self.reaped {
            let _ = self.kill();
        }
    }
}

impl std::fmt::Debug for LocalProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessHandle")
            .field("pid", &self.pid)
            .field("own_group", &self.own_group)
            .field("reaped", &self.reaped)
            .finish()
    }
}
