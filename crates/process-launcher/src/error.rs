//! Error types for process launching

use thiserror::Error;

/// Unified error type for launching and signalling processes
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// Program could not be found on PATH
    #[error("command not found: {command}")]
    CommandNotFound {
        /// The command that was not found
        command: String,
    },

    /// Failed to send signal to process
    #[error("failed to send {signal} to pid {pid}: {reason}")]
    SignalFailed {
        /// Target pid
        pid: u32,
        /// Signal name
        signal: String,
        /// The reason for the signal failure
        reason: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create a signal failed error
    pub fn signal_failed(pid: u32, signal: nix::sys::signal::Signal, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            pid,
            signal: signal.as_str().to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
