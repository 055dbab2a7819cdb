//! Record store implementations

pub mod memory;
pub mod sled;

use crate::{error::Result, models::*};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use process_launcher::OutputLine;

/// Persistence seam for service records, dependency edges, uptime events and logs
///
/// Runtime fields are never persisted; services always load stopped.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All persisted service definitions
    async fn load_services(&self) -> Result<Vec<Service>>;

    /// Insert or replace a service definition
    async fn save_service(&self, service: &Service) -> Result<()>;

    /// Remove a service and everything keyed by it
    async fn delete_service(&self, id: ServiceId) -> Result<()>;

    /// All persisted dependency edges
    async fn load_dependencies(&self) -> Result<Vec<DependencyEdge>>;

    /// Replace the outgoing edges of `from`
    async fn save_dependencies(&self, from: ServiceId, edges: &[DependencyEdge]) -> Result<()>;

    /// Append a captured log line
    async fn append_log(&self, id: ServiceId, line: &OutputLine) -> Result<()>;

    /// Query captured log lines, oldest first
    async fn query_logs(&self, id: ServiceId, query: &LogQuery) -> Result<Vec<OutputLine>>;

    /// Append an uptime event
    async fn append_uptime_event(&self, event: &UptimeEvent) -> Result<()>;

    /// Uptime events for a service, oldest first
    async fn load_uptime_events(&self, id: ServiceId) -> Result<Vec<UptimeEvent>>;

    /// Timestamp of the first `started` event ever appended for a service.
    ///
    /// Kept apart from the bounded event log so trimming cannot lose it.
    async fn first_started_at(&self, id: ServiceId) -> Result<Option<DateTime<Utc>>>;
}

/// Retention limits applied by the stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Log lines kept per service
    pub logs_per_service: usize,
    /// Uptime events kept per service
    pub uptime_per_service: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            logs_per_service: 10_000,
            uptime_per_service: 1_000,
        }
    }
}
