//! Sled database record store

use super::{RecordStore, Retention};
use crate::{error::Result, models::*};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use process_launcher::OutputLine;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info};

/// Sled-based record store
///
/// Trees: `services` and `dependencies` keyed by service id; `uptime` and
/// `logs` keyed by service id followed by a monotonic sequence number so a
/// prefix scan yields one service's entries oldest first. `first_start`
/// holds each service's first-ever start time, which outlives uptime trimming.
pub struct SledStore {
    db: sled::Db,
    services: sled::Tree,
    dependencies: sled::Tree,
    uptime: sled::Tree,
    logs: sled::Tree,
    first_start: sled::Tree,
    retention: Retention,
    // Entry counts per (tree, service), filled lazily on first append
    counts: Mutex<HashMap<(&'static str, ServiceId), usize>>,
}

impl SledStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>, retention: Retention) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        info!("Opening sled database at {:?}", path);
        let db = sled::open(path)?;
        Self::from_db(db, retention)
    }

    /// Create a temporary store (for testing)
    pub fn temporary() -> Result<Self> {
        debug!("Creating temporary sled database");
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, Retention::default())
    }

    fn from_db(db: sled::Db, retention: Retention) -> Result<Self> {
        Ok(Self {
            services: db.open_tree("services")?,
            dependencies: db.open_tree("dependencies")?,
            uptime: db.open_tree("uptime")?,
            logs: db.open_tree("logs")?,
            first_start: db.open_tree("first_start")?,
            db,
            retention,
            counts: Mutex::new(HashMap::new()),
        })
    }

    fn sequenced_key(&self, id: ServiceId) -> Result<Vec<u8>> {
        let seq = self.db.generate_id()?;
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key)
    }

    /// Append under a sequenced key and trim the oldest entries beyond `cap`
    fn append_bounded(
        &self,
        tree: &sled::Tree,
        tree_name: &'static str,
        id: ServiceId,
        value: Vec<u8>,
        cap: usize,
    ) -> Result<()> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        tree.insert(self.sequenced_key(id)?, value)?;

        let count = match counts.get(&(tree_name, id)) {
            Some(count) => count + 1,
            None => tree.scan_prefix(id.as_bytes()).count(),
        };

        let cap = cap.max(1);
        let mut remaining = count;
        if count > cap {
            let excess = count - cap;
            let stale: Vec<_> = tree
                .scan_prefix(id.as_bytes())
                .keys()
                .take(excess)
                .collect::<std::result::Result<_, _>>()?;
            for key in stale {
                tree.remove(key)?;
                remaining -= 1;
            }
        }
        counts.insert((tree_name, id), remaining);
        Ok(())
    }

    fn clear_prefix(tree: &sled::Tree, id: ServiceId) -> Result<()> {
        let keys: Vec<_> = tree
            .scan_prefix(id.as_bytes())
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for key in keys {
            tree.remove(key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SledStore {
    async fn load_services(&self) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        for result in self.services.iter() {
            let (_, value) = result?;
            services.push(serde_json::from_slice(&value)?);
        }
        debug!("Loaded {} services", services.len());
        Ok(services)
    }

    async fn save_service(&self, service: &Service) -> Result<()> {
        debug!("Storing service: {}", service.name);
        let value = serde_json::to_vec(service)?;
        self.services.insert(service.id.as_bytes(), value)?;
        self.services.flush_async().await?;
        Ok(())
    }

    async fn delete_service(&self, id: ServiceId) -> Result<()> {
        debug!("Removing service: {}", id);
        self.services.remove(id.as_bytes())?;
        self.dependencies.remove(id.as_bytes())?;
        self.first_start.remove(id.as_bytes())?;
        Self::clear_prefix(&self.uptime, id)?;
        Self::clear_prefix(&self.logs, id)?;
        {
            let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
            counts.retain(|(_, counted), _| *counted != id);
        }
        self.db.flush_async().await?;
        Ok(())
    }

    async fn load_dependencies(&self) -> Result<Vec<DependencyEdge>> {
        let mut edges = Vec::new();
        for result in self.dependencies.iter() {
            let (_, value) = result?;
            let batch: Vec<DependencyEdge> = serde_json::from_slice(&value)?;
            edges.extend(batch);
        }
        Ok(edges)
    }

    async fn save_dependencies(&self, from: ServiceId, edges: &[DependencyEdge]) -> Result<()> {
        let value = serde_json::to_vec(edges)?;
        self.dependencies.insert(from.as_bytes(), value)?;
        self.dependencies.flush_async().await?;
        Ok(())
    }

    async fn append_log(&self, id: ServiceId, line: &OutputLine) -> Result<()> {
        let value = serde_json::to_vec(line)?;
        self.append_bounded(&self.logs, "logs", id, value, self.retention.logs_per_service)
    }

    async fn query_logs(&self, id: ServiceId, query: &LogQuery) -> Result<Vec<OutputLine>> {
        let mut lines = Vec::new();
        for result in self.logs.scan_prefix(id.as_bytes()) {
            let (_, value) = result?;
            lines.push(serde_json::from_slice::<OutputLine>(&value)?);
        }
        Ok(query.apply(lines.iter()))
    }

    async fn append_uptime_event(&self, event: &UptimeEvent) -> Result<()> {
        if event.kind == UptimeEventKind::Started {
            let first = serde_json::to_vec(&event.timestamp)?;
            // Only the first start wins; a lost race means one is already stored
            let _ = self.first_start.compare_and_swap(
                event.service_id.as_bytes(),
                None as Option<&[u8]>,
                Some(first),
            )?;
        }
        let value = serde_json::to_vec(event)?;
        self.append_bounded(
            &self.uptime,
            "uptime",
            event.service_id,
            value,
            self.retention.uptime_per_service,
        )?;
        self.uptime.flush_async().await?;
        Ok(())
    }

    async fn load_uptime_events(&self, id: ServiceId) -> Result<Vec<UptimeEvent>> {
        let mut events = Vec::new();
        for result in self.uptime.scan_prefix(id.as_bytes()) {
            let (_, value) = result?;
            events.push(serde_json::from_slice(&value)?);
        }
        Ok(events)
    }

    async fn first_started_at(&self, id: ServiceId) -> Result<Option<DateTime<Utc>>> {
        match self.first_start.get(id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}

impl Drop for SledStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            error!("Failed to flush database on drop: {}", e);
        }
    }
}
