//! # Stack configuration
//!
//! YAML stack file parser for devstack.
//!
//! A stack file declares engine settings, services with their dependencies,
//! and profiles. [`parser::parse_file`] validates it and [`StackFile::resolve`]
//! turns it into registry definitions ready for the engine.
//!
//! ```yaml
//! version: "1.0"
//! settings:
//!   health_interval_ms: 2000
//!   restart:
//!     max_retries: 5
//! services:
//!   db:
//!     directory: db
//!     command: ./run-db.sh
//!     port: 5432
//!   api:
//!     directory: api
//!     build: maven
//!     health_url: http://localhost:8080/actuator/health
//!     depends_on:
//!       - service: db
//!         healthy: true
//!         wait_secs: 90
//! profiles:
//!   backend:
//!     services: [db, api]
//!     env:
//!       SPRING_PROFILES_ACTIVE: local
//! ```

#![warn(missing_docs)]

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use service_orchestration::EngineConfig;
use service_registry::{ProfileIndex, Service};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub mod parser;
pub mod resolver;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the stack file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable not found
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    /// Service reference not found
    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    /// Profile reference not found
    #[error("Profile '{0}' not found")]
    ProfileNotFound(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root of a stack file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFile {
    /// Format version, currently "1.0"
    pub version: String,

    /// Optional stack name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Engine settings; anything omitted keeps its default
    #[serde(default)]
    pub settings: EngineConfig,

    /// Services keyed by name, in file order
    pub services: IndexMap<String, ServiceSpec>,

    /// Profiles keyed by name
    #[serde(default)]
    pub profiles: IndexMap<String, ProfileSpec>,
}

/// Build tool of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildKind {
    /// Maven project
    Maven,
    /// Gradle project
    Gradle,
    /// npm project
    Npm,
    /// Cargo project
    Cargo,
    /// Arbitrary shell `command`
    #[default]
    Shell,
}

/// A service entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Source directory, relative to the projects dir unless absolute
    pub directory: PathBuf,

    /// Build tool
    #[serde(default)]
    pub build: BuildKind,

    /// Command line for `shell` services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Listening port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// HTTP health endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,

    /// Start order tie-break
    #[serde(default)]
    pub order: i32,

    /// Environment, values may use `${VAR}` and `${VAR:-default}`
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Dependencies on other services in this file
    #[serde(default)]
    pub depends_on: Vec<DependsOn>,
}

/// A dependency, either a bare service name or a detailed edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    /// Required, no health requirement, engine default wait
    Name(String),
    /// Fully specified edge
    Detailed {
        /// Target service
        service: String,
        /// Whether the dependent may not start without it
        #[serde(default = "default_required")]
        required: bool,
        /// Whether the target must also be healthy
        #[serde(default)]
        healthy: bool,
        /// Wait override in seconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_secs: Option<u64>,
    },
}

fn default_required() -> bool {
    true
}

impl DependsOn {
    /// Name of the target service
    pub fn target(&self) -> &str {
        match self {
            DependsOn::Name(name) => name,
            DependsOn::Detailed { service, .. } => service,
        }
    }
}

/// A profile entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileSpec {
    /// Member service names
    #[serde(default)]
    pub services: Vec<String>,

    /// Overrides the projects dir for members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects_dir: Option<PathBuf>,

    /// Environment layered between settings and service values
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A validated stack ready for the engine
#[derive(Debug, Clone)]
pub struct Stack {
    /// Engine settings
    pub settings: EngineConfig,
    /// Service definitions in file order
    pub services: Vec<Service>,
    /// Profile index
    pub profiles: ProfileIndex,
}

impl Stack {
    /// Look up a service definition by name
    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::ServiceNotFound(name.to_string()))
    }
}
