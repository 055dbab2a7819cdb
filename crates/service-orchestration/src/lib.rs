//! # Service orchestration
//!
//! Dependency-ordered supervision of local development services.
//!
//! The [`Orchestrator`] is the entry point. It owns:
//!
//! - a [`Resolver`] computing start orders and tiers from the registry's
//!   dependency graph, remembering the last order per scope so shutdown is
//!   its exact reverse
//! - a [`Supervisor`] launching processes through a [`BuildRunner`],
//!   streaming their output into per-service log rings and reporting
//!   unexpected exits
//! - a [`HealthMonitor`] running one debounced probe loop per running
//!   service
//! - a [`PortReclaimer`] that clears a service's port before it starts
//! - an [`UptimeTracker`] deriving availability figures from lifecycle events
//!
//! ## Example
//!
//! ```no_run
//! use service_orchestration::{EngineConfig, Orchestrator};
//! use service_registry::{BuildSystem, ProfileContext, Service};
//!
//! # async fn example() -> service_orchestration::Result<()> {
//! let engine = Orchestrator::new(EngineConfig::default())?;
//!
//! let db = Service::new("db", "db", BuildSystem::Shell { command: "./run-db.sh".into() })
//!     .with_port(5432);
//! let api = Service::new("api", "api", BuildSystem::Maven)
//!     .with_health_url("http://localhost:8080/actuator/health")
//!     .depends_on(db.id);
//! engine.add_services(vec![db, api]).await?;
//!
//! let report = engine.start_all(&ProfileContext::all()).await?;
//! println!("{}", report.outcomes.len());
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod ports;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod supervisor;
pub mod uptime;

pub use config::{BatchMode, EngineConfig, RestartPolicy};
pub use error::{Error, Result};
pub use health::{HealthMonitor, HealthSettings, HttpProber, ProbeOutcome, Prober};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use ports::{
    CleanupResult, PidError, PortReclaimer, PortScanner, SystemPortScanner, port_in_use,
};
pub use report::{BatchOperation, BatchReport, Outcome, ServiceOutcome};
pub use resolver::Resolver;
pub use runner::{BuildRunner, DefaultBuildRunner};
pub use supervisor::{CrashNotice, StopOutcome, Supervisor};
pub use uptime::{UptimeStats, UptimeTracker};
