//! In-memory record store

use super::{RecordStore, Retention};
use crate::{error::Result, models::*};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use process_launcher::OutputLine;
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

#[derive(Default)]
struct Tables {
    services: IndexMap<ServiceId, Service>,
    dependencies: IndexMap<ServiceId, Vec<DependencyEdge>>,
    logs: HashMap<ServiceId, VecDeque<OutputLine>>,
    uptime: HashMap<ServiceId, VecDeque<UptimeEvent>>,
    first_started: HashMap<ServiceId, DateTime<Utc>>,
}

/// Record store that lives only as long as the process
pub struct MemoryStore {
    tables: RwLock<Tables>,
    retention: Retention,
}

impl MemoryStore {
    /// Create an empty store with default retention
    pub fn new() -> Self {
        Self::with_retention(Retention::default())
    }

    /// Create an empty store with explicit retention
    pub fn with_retention(retention: Retention) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            retention,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    while queue.len() >= cap.max(1) {
        queue.pop_front();
    }
    queue.push_back(item);
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_services(&self) -> Result<Vec<Service>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.services.values().cloned().collect())
    }

    async fn save_service(&self, service: &Service) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.services.insert(service.id, service.clone());
        Ok(())
    }

    async fn delete_service(&self, id: ServiceId) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.services.shift_remove(&id);
        tables.dependencies.shift_remove(&id);
        tables.logs.remove(&id);
        tables.uptime.remove(&id);
        tables.first_started.remove(&id);
        Ok(())
    }

    async fn load_dependencies(&self) -> Result<Vec<DependencyEdge>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.dependencies.values().flatten().cloned().collect())
    }

    async fn save_dependencies(&self, from: ServiceId, edges: &[DependencyEdge]) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.dependencies.insert(from, edges.to_vec());
        Ok(())
    }

    async fn append_log(&self, id: ServiceId, line: &OutputLine) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let queue = tables.logs.entry(id).or_default();
        push_bounded(queue, line.clone(), self.retention.logs_per_service);
        Ok(())
    }

    async fn query_logs(&self, id: ServiceId, query: &LogQuery) -> Result<Vec<OutputLine>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .logs
            .get(&id)
            .map(|queue| query.apply(queue.iter()))
            .unwrap_or_default())
    }

    async fn append_uptime_event(&self, event: &UptimeEvent) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if event.kind == UptimeEventKind::Started {
            tables
                .first_started
                .entry(event.service_id)
                .or_insert(event.timestamp);
        }
        let queue = tables.uptime.entry(event.service_id).or_default();
        push_bounded(queue, *event, self.retention.uptime_per_service);
        Ok(())
    }

    async fn load_uptime_events(&self, id: ServiceId) -> Result<Vec<UptimeEvent>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .uptime
            .get(&id)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn first_started_at(&self, id: ServiceId) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.first_started.get(&id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use process_launcher::LogSource;

    #[smol_potat::test]
    async fn test_memory_store_bounds_per_service() {
        let store = MemoryStore::with_retention(Retention {
            logs_per_service: 2,
            uptime_per_service: 2,
        });
        let id = service_id_for_name("api");

        for i in 0..3 {
            store
                .append_log(id, &OutputLine::new(LogSource::Stdout, format!("l{i}")))
                .await
                .unwrap();
        }
        for kind in [
            UptimeEventKind::Started,
            UptimeEventKind::Healthy,
            UptimeEventKind::Stopped,
        ] {
            store
                .append_uptime_event(&UptimeEvent::now(id, kind))
                .await
                .unwrap();
        }

        let logs = store.query_logs(id, &LogQuery::default()).await.unwrap();
        assert_eq!(logs.iter().map(|l| l.line.as_str()).collect::<Vec<_>>(), ["l1", "l2"]);

        let events = store.load_uptime_events(id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, UptimeEventKind::Healthy);
    }
}
