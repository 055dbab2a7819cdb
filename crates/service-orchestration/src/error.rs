//! Error types for orchestration operations

use thiserror::Error;

use crate::ports::CleanupResult;
use crate::report::BatchReport;

/// Orchestration error type
#[derive(Error, Debug)]
pub enum Error {
    /// Registry errors: unknown services, duplicates, cycles, missing targets, dependents
    #[error(transparent)]
    Registry(#[from] service_registry::Error),

    /// Process launcher errors
    #[error("Process error: {0}")]
    Launcher(#[from] process_launcher::Error),

    /// A required dependency did not become ready in time
    #[error("Dependency '{dependency}' of '{service}' not ready: {reason}")]
    DependencyNotReady {
        /// Service being started
        service: String,
        /// Dependency that was not ready
        dependency: String,
        /// Status and health observed when the wait ended
        reason: String,
    },

    /// The process could not be spawned; the service is now crashed
    #[error("Failed to spawn '{service}': {reason}")]
    ProcessSpawn {
        /// Service name
        service: String,
        /// Underlying cause
        reason: String,
    },

    /// The port stayed occupied after cleanup
    #[error("Port {port} for '{service}' is still in use")]
    PortConflict {
        /// Service name
        service: String,
        /// The contested port
        port: u16,
        /// What the reclaimer found and did
        cleanup: CleanupResult,
    },

    /// The process was still alive after SIGKILL
    #[error("Pid {pid} of '{service}' survived SIGKILL")]
    StopFailed {
        /// Service name
        service: String,
        /// The surviving pid
        pid: u32,
    },

    /// A health probe could not be evaluated
    #[error("Health check error: {0}")]
    HealthProbe(String),

    /// Some services in a batch failed
    #[error("{}", .0.summary())]
    PartialBatchFailure(BatchReport),

    /// A lifecycle operation is already running for this service
    #[error("An operation is already in progress for '{service}'")]
    AlreadyInProgress {
        /// Service name
        service: String,
    },

    /// The engine is shutting down
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error stems from configuration rather than runtime state
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::Registry(inner) => inner.is_configuration(),
            Error::Config(_) => true,
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
