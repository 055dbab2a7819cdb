//! Per-service runtime cell
//!
//! Each registered service owns a cell with three independent guards:
//! a state lock held only for short synchronous sections, a log lock for the
//! output ring, and an async operation guard that serializes lifecycle
//! mutations on the same service.

use chrono::{DateTime, Utc};
use futures::lock::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use process_launcher::OutputLine;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::models::{
    HealthStatus, LogQuery, MetricsSnapshot, Service, ServiceId, ServiceView, Status,
};

/// Mutable runtime fields of a service
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    /// Lifecycle status
    pub status: Status,
    /// Debounced health
    pub health: HealthStatus,
    /// Root pid, set iff a process exists
    pub pid: Option<u32>,
    /// When the current process was launched
    pub started_at: Option<DateTime<Utc>>,
    /// Automatic restarts since the last manual start or healthy verdict
    pub restart_attempts: u32,
    /// Consecutive failed probes
    pub consecutive_failures: u32,
    /// Set while a requested stop is in flight so exits are not treated as crashes
    pub stop_requested: bool,
    /// Latest metrics
    pub metrics: MetricsSnapshot,
}

/// Bounded ring of captured output
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<OutputLine>,
    capacity: usize,
}

impl LogBuffer {
    /// Create an empty ring
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append, evicting the oldest line when full
    pub fn push(&mut self, line: OutputLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Lines currently held
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Filtered copy in chronological order
    pub fn query(&self, query: &LogQuery) -> Vec<OutputLine> {
        query.apply(self.lines.iter())
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// A registered service: immutable definition plus guarded runtime state
#[derive(Debug)]
pub struct ServiceCell {
    id: ServiceId,
    definition: RwLock<Arc<Service>>,
    state: RwLock<RuntimeState>,
    logs: Mutex<LogBuffer>,
    op: AsyncMutex<()>,
}

impl ServiceCell {
    /// Wrap a definition with fresh runtime state
    pub fn new(service: Service, log_capacity: usize) -> Self {
        Self {
            id: service.id,
            definition: RwLock::new(Arc::new(service)),
            state: RwLock::new(RuntimeState::default()),
            logs: Mutex::new(LogBuffer::new(log_capacity)),
            op: AsyncMutex::new(()),
        }
    }

    /// Service id
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Current definition
    pub fn definition(&self) -> Arc<Service> {
        self.definition
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Service name
    pub fn name(&self) -> String {
        self.definition().name.clone()
    }

    pub(crate) fn replace_definition(&self, service: Service) -> Arc<Service> {
        let mut guard = self
            .definition
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(service))
    }

    /// Copy of the runtime state
    pub fn state(&self) -> RuntimeState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Current health
    pub fn health(&self) -> HealthStatus {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .health
    }

    /// Current pid
    pub fn pid(&self) -> Option<u32> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).pid
    }

    /// Run a short synchronous mutation under the state lock.
    ///
    /// Status and health changes that must be published go through
    /// [`crate::Registry`] instead so subscribers see them.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut RuntimeState) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Append a captured line to the ring
    pub fn push_log(&self, line: OutputLine) {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    /// Query the ring
    pub fn logs(&self, query: &LogQuery) -> Vec<OutputLine> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .query(query)
    }

    /// Lines currently buffered
    pub fn log_len(&self) -> usize {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take the operation guard, failing immediately if a mutation is in flight
    pub fn try_begin_operation(&self) -> Option<AsyncMutexGuard<'_, ()>> {
        self.op.try_lock()
    }

    /// Point-in-time view
    pub fn view(&self) -> ServiceView {
        let state = self.state();
        let mut metrics = state.metrics.clone();
        metrics.restart_attempts = state.restart_attempts;
        metrics.buffered_log_lines = self.log_len();
        ServiceView {
            service: (*self.definition()).clone(),
            status: state.status,
            health: state.health,
            pid: state.pid,
            started_at: state.started_at,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BuildSystem;
    use process_launcher::LogSource;

    #[test]
    fn test_log_ring_evicts_oldest() {
        let mut ring = LogBuffer::new(3);
        for i in 0..5 {
            ring.push(OutputLine::new(LogSource::Stdout, format!("line {i}")));
        }
        assert_eq!(ring.len(), 3);
        let lines = ring.query(&LogQuery::default());
        assert_eq!(lines[0].line, "line 2");
        assert_eq!(lines[2].line, "line 4");
    }

    #[smol_potat::test]
    async fn test_operation_guard_fails_fast() {
        let cell = ServiceCell::new(Service::new("api", "api", BuildSystem::Npm), 10);
        let guard = cell.try_begin_operation();
        assert!(guard.is_some());
        assert!(cell.try_begin_operation().is_none());
        drop(guard);
        assert!(cell.try_begin_operation().is_some());
    }

    #[test]
    fn test_view_reflects_state() {
        let cell = ServiceCell::new(Service::new("api", "api", BuildSystem::Npm), 10);
        cell.with_state(|s| {
            s.status = Status::Running;
            s.pid = Some(42);
            s.restart_attempts = 2;
        });
        cell.push_log(OutputLine::new(LogSource::Stdout, "hello"));

        let view = cell.view();
        assert_eq!(view.status, Status::Running);
        assert_eq!(view.pid, Some(42));
        assert_eq!(view.metrics.restart_attempts, 2);
        assert_eq!(view.metrics.buffered_log_lines, 1);
    }
}
