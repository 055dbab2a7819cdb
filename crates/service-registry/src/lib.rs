//! Service registry for devstack
//!
//! The registry is the single source of truth for service definitions and
//! their live state. It provides:
//!
//! - [`Service`] definitions with typed [`DependencyEdge`]s
//! - a per-service [`ServiceCell`] holding the state machine, log ring and
//!   operation guard
//! - a [`DependencyGraph`] for validation and ordering
//! - bounded, drop-oldest change notifications via [`Registry::subscribe`]
//! - a [`RecordStore`] seam with in-memory and sled implementations
//! - a bidirectional [`ProfileIndex`]
//!
//! # Example
//!
//! ```no_run
//! use service_registry::{BuildSystem, Registry, Service};
//!
//! # async fn example() -> service_registry::Result<()> {
//! let registry = Registry::in_memory();
//! let db = Service::new("db", "db", BuildSystem::Cargo).with_port(5432);
//! let api = Service::new("api", "api", BuildSystem::Maven).depends_on(db.id);
//! registry.add_services(vec![db, api]).await?;
//!
//! let order = registry.graph().order(None);
//! # let _ = order;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cell;
pub mod error;
pub mod events;
pub mod graph;
pub mod models;
pub mod profile;
pub mod registry;

pub use backend::{RecordStore, Retention, memory::MemoryStore, sled::SledStore};
pub use cell::{LogBuffer, RuntimeState, ServiceCell};
pub use error::{Error, Result};
pub use events::{ChangeKind, EventBus, ServiceChangeEvent, Subscription, SubscriptionId};
pub use graph::{DependencyGraph, GraphIssue};
pub use models::*;
pub use profile::{Profile, ProfileContext, ProfileIndex};
pub use registry::{Registry, RegistrySettings};
