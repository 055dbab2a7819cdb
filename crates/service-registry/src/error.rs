//! Error types for the service registry

use thiserror::Error;

use crate::models::{ServiceId, Status};

/// Service registry error type
#[derive(Error, Debug)]
pub enum Error {
    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// A service with this id is already registered
    #[error("Service id already registered: {0}")]
    DuplicateId(ServiceId),

    /// A service with this name is already registered
    #[error("Service name already registered: {0}")]
    DuplicateName(String),

    /// A dependency points at a service that does not exist
    #[error("Service '{service}' depends on unknown service {target}")]
    MissingDependency {
        /// Name of the dependent service
        service: String,
        /// The id that could not be resolved
        target: ServiceId,
    },

    /// The dependency graph contains at least one cycle
    #[error("Dependency cycle between: {}", names.join(", "))]
    DependencyCycle {
        /// Every service participating in a cycle
        ids: Vec<ServiceId>,
        /// Their names, in the same order
        names: Vec<String>,
    },

    /// Deleting would orphan services that depend on this one
    #[error("Service '{service}' is required by: {}", dependents.join(", "))]
    DependentsExist {
        /// The service being deleted
        service: String,
        /// Names of the services depending on it
        dependents: Vec<String>,
    },

    /// Invalid status transition
    #[error("Invalid state transition for '{service}': {from:?} -> {to:?}")]
    InvalidTransition {
        /// Service name
        service: String,
        /// Current status
        from: Status,
        /// Attempted status
        to: Status,
    },

    /// Invalid service definition
    #[error("Invalid service definition: {0}")]
    InvalidDefinition(String),

    /// Record store failure
    #[error("Store error: {0}")]
    Store(#[from] sled::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error describes a bad configuration rather than a runtime failure
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DuplicateId(_)
                | Error::DuplicateName(_)
                | Error::MissingDependency { .. }
                | Error::DependencyCycle { .. }
                | Error::DependentsExist { .. }
                | Error::InvalidDefinition(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
