//! Core service registry implementation

use crate::{
    backend::{RecordStore, memory::MemoryStore},
    cell::ServiceCell,
    error::{Error, Result},
    events::{ChangeKind, EventBus, ServiceChangeEvent, Subscription, SubscriptionId},
    graph::{DependencyGraph, GraphIssue},
    models::*,
};
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Sizing for per-service buffers and subscriber queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Lines kept in each service's in-memory log ring
    pub log_capacity: usize,
    /// Events buffered per subscriber before the oldest is dropped
    pub subscriber_buffer: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            log_capacity: 2_000,
            subscriber_buffer: 256,
        }
    }
}

/// Catalogue of services with a pluggable record store
pub struct Registry {
    cells: RwLock<IndexMap<ServiceId, Arc<ServiceCell>>>,
    store: Arc<dyn RecordStore>,
    bus: EventBus,
    settings: RegistrySettings,
}

impl Registry {
    /// Create a registry backed by `store`
    pub fn new(store: Arc<dyn RecordStore>, settings: RegistrySettings) -> Self {
        Self {
            cells: RwLock::new(IndexMap::new()),
            store,
            bus: EventBus::new(settings.subscriber_buffer),
            settings,
        }
    }

    /// Registry with an in-memory store and default settings
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), RegistrySettings::default())
    }

    /// The attached record store
    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    /// Load persisted services and dependency edges.
    ///
    /// Returns the number of services loaded. Everything loads stopped.
    pub async fn load(&self) -> Result<usize> {
        let services = self.store.load_services().await?;
        let edges = self.store.load_dependencies().await?;

        let mut by_from: HashMap<ServiceId, Vec<DependencyEdge>> = HashMap::new();
        for edge in edges {
            by_from.entry(edge.from).or_default().push(edge);
        }

        let mut loaded = Vec::with_capacity(services.len());
        for mut service in services {
            if let Some(edges) = by_from.remove(&service.id) {
                service.dependencies = edges;
            }
            loaded.push(service);
        }

        let graph = DependencyGraph::new(loaded.iter());
        for issue in graph.validate(None) {
            warn!("Persisted dependency graph problem: {:?}", issue);
        }

        let count = loaded.len();
        {
            let mut cells = self.write_cells();
            for service in loaded {
                let cell = Arc::new(ServiceCell::new(service, self.settings.log_capacity));
                cells.insert(cell.id(), cell);
            }
        }
        info!("Loaded {} services from store", count);
        Ok(count)
    }

    fn read_cells(&self) -> std::sync::RwLockReadGuard<'_, IndexMap<ServiceId, Arc<ServiceCell>>> {
        self.cells.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cells(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, IndexMap<ServiceId, Arc<ServiceCell>>> {
        self.cells.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_graph(services: &[Service]) -> Result<()> {
        let graph = DependencyGraph::new(services.iter());
        let mut cycle_ids = Vec::new();
        for issue in graph.validate(None) {
            match issue {
                GraphIssue::MissingTarget { from, to } => {
                    return Err(Error::MissingDependency {
                        service: graph.name_of(&from).unwrap_or_default().to_string(),
                        target: to,
                    });
                }
                GraphIssue::Cycle { ids } => cycle_ids.extend(ids),
            }
        }
        if cycle_ids.is_empty() {
            Ok(())
        } else {
            let names = cycle_ids
                .iter()
                .map(|id| graph.name_of(id).unwrap_or_default().to_string())
                .collect();
            Err(Error::DependencyCycle {
                ids: cycle_ids,
                names,
            })
        }
    }

    fn normalize(mut service: Service) -> Result<Service> {
        if service.name.trim().is_empty() {
            return Err(Error::InvalidDefinition("service name is empty".into()));
        }
        for edge in &mut service.dependencies {
            edge.from = service.id;
        }
        Ok(service)
    }

    /// Definitions with `replaced` swapped in (or appended), for validation
    fn candidate_set(&self, replaced: &[Service]) -> Vec<Service> {
        let cells = self.read_cells();
        let mut out: Vec<Service> = cells
            .values()
            .map(|cell| {
                let def = cell.definition();
                replaced
                    .iter()
                    .find(|s| s.id == def.id)
                    .cloned()
                    .unwrap_or_else(|| (*def).clone())
            })
            .collect();
        for service in replaced {
            if !cells.contains_key(&service.id) {
                out.push(service.clone());
            }
        }
        out
    }

    fn publish(&self, id: ServiceId, name: &str, kind: ChangeKind) {
        self.bus.publish(ServiceChangeEvent {
            service_id: id,
            service_name: name.to_string(),
            kind,
            timestamp: Utc::now(),
        });
    }

    async fn persist(&self, service: &Service) -> Result<()> {
        self.store.save_service(service).await?;
        self.store
            .save_dependencies(service.id, &service.dependencies)
            .await
    }

    /// Register a new service
    pub async fn add_service(&self, service: Service) -> Result<Arc<ServiceCell>> {
        let mut cells = self.add_services(vec![service]).await?;
        cells.pop().ok_or_else(|| Error::InvalidDefinition("nothing registered".into()))
    }

    /// Register several services at once; edges may point at each other
    pub async fn add_services(&self, services: Vec<Service>) -> Result<Vec<Arc<ServiceCell>>> {
        let services = services
            .into_iter()
            .map(Self::normalize)
            .collect::<Result<Vec<_>>>()?;

        let added: Vec<Arc<ServiceCell>> = {
            let mut cells = self.write_cells();
            let mut names: HashMap<String, ServiceId> = cells
                .values()
                .map(|cell| (cell.name(), cell.id()))
                .collect();

            for service in &services {
                if cells.contains_key(&service.id) {
                    return Err(Error::DuplicateId(service.id));
                }
                if names.insert(service.name.clone(), service.id).is_some() {
                    return Err(Error::DuplicateName(service.name.clone()));
                }
            }

            let mut all: Vec<Service> = cells.values().map(|c| (*c.definition()).clone()).collect();
            all.extend(services.iter().cloned());
            Self::check_graph(&all)?;

            services
                .iter()
                .map(|service| {
                    let cell = Arc::new(ServiceCell::new(service.clone(), self.settings.log_capacity));
                    cells.insert(service.id, cell.clone());
                    cell
                })
                .collect()
        };

        for service in &services {
            if let Err(e) = self.persist(service).await {
                warn!("Failed to persist {}: {}", service.name, e);
                let mut cells = self.write_cells();
                for s in &services {
                    cells.shift_remove(&s.id);
                }
                return Err(e);
            }
        }

        for service in &services {
            info!("Registered service {} ({})", service.name, service.id);
            self.publish(service.id, &service.name, ChangeKind::Added);
        }
        Ok(added)
    }

    /// Replace a service definition; runtime state is kept
    pub async fn update_service(&self, service: Service) -> Result<()> {
        let service = Self::normalize(service)?;
        let cell = self.get(service.id)?;

        {
            let cells = self.read_cells();
            if cells
                .values()
                .any(|other| other.id() != service.id && other.name() == service.name)
            {
                return Err(Error::DuplicateName(service.name.clone()));
            }
        }
        Self::check_graph(&self.candidate_set(std::slice::from_ref(&service)))?;

        self.persist(&service).await?;
        let previous = cell.replace_definition(service.clone());
        debug!("Updated {} (was {})", service.name, previous.name);
        self.publish(service.id, &service.name, ChangeKind::Updated);
        Ok(())
    }

    /// Replace the outgoing dependency edges of a service
    pub async fn set_dependencies(&self, id: ServiceId, edges: Vec<DependencyEdge>) -> Result<()> {
        let cell = self.get(id)?;
        let mut service = (*cell.definition()).clone();
        service.dependencies = edges;
        let service = Self::normalize(service)?;

        Self::check_graph(&self.candidate_set(std::slice::from_ref(&service)))?;

        self.store.save_dependencies(id, &service.dependencies).await?;
        self.store.save_service(&service).await?;
        let name = service.name.clone();
        cell.replace_definition(service);
        info!("Dependencies of {} updated", name);
        self.publish(id, &name, ChangeKind::Updated);
        Ok(())
    }

    /// Remove a service.
    ///
    /// Rejected while other services depend on it unless `force`, in which
    /// case the dependents' edges to it are removed as well.
    pub async fn delete_service(&self, id: ServiceId, force: bool) -> Result<Service> {
        let cell = self.get(id)?;
        let name = cell.name();
        let graph = self.graph();
        let dependents = graph.dependents_of(&id);

        if !dependents.is_empty() {
            if !force {
                return Err(Error::DependentsExist {
                    service: name,
                    dependents: dependents
                        .iter()
                        .map(|d| graph.name_of(d).unwrap_or_default().to_string())
                        .collect(),
                });
            }
            for dependent in dependents {
                let dep_cell = self.get(dependent)?;
                let edges: Vec<DependencyEdge> = dep_cell
                    .definition()
                    .dependencies
                    .iter()
                    .filter(|edge| edge.to != id)
                    .cloned()
                    .collect();
                self.set_dependencies(dependent, edges).await?;
            }
        }

        self.store.delete_service(id).await?;
        self.write_cells().shift_remove(&id);
        info!("Deleted service {} ({})", name, id);
        self.publish(id, &name, ChangeKind::Removed);
        Ok((*cell.definition()).clone())
    }

    /// Look up a service by id
    pub fn get(&self, id: ServiceId) -> Result<Arc<ServiceCell>> {
        self.read_cells()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    /// Look up a service by name
    pub fn get_by_name(&self, name: &str) -> Result<Arc<ServiceCell>> {
        self.read_cells()
            .values()
            .find(|cell| cell.definition().name == name)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// All services in registration order
    pub fn cells(&self) -> Vec<Arc<ServiceCell>> {
        self.read_cells().values().cloned().collect()
    }

    /// Snapshot of every definition
    pub fn definitions(&self) -> Vec<Arc<Service>> {
        self.read_cells().values().map(|c| c.definition()).collect()
    }

    /// Dependency graph over the current definitions
    pub fn graph(&self) -> DependencyGraph {
        let defs = self.definitions();
        DependencyGraph::new(defs.iter().map(|d| d.as_ref()))
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.read_cells().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.read_cells().is_empty()
    }

    /// Move a service to a new status and publish the change.
    ///
    /// `pid` is recorded when entering a status with a live process and
    /// cleared otherwise. Returns the previous status. Setting the current
    /// status again is a silent no-op.
    pub fn set_status(&self, cell: &ServiceCell, to: Status, pid: Option<u32>) -> Result<Status> {
        let name = cell.name();
        let (from, health_change) = cell.with_state(|state| {
            let from = state.status;
            if from == to {
                if to.has_process() && pid.is_some() {
                    state.pid = pid;
                }
                return Ok((from, None));
            }
            if !from.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    service: name.clone(),
                    from,
                    to,
                });
            }
            if to.has_process() && pid.or(state.pid).is_none() {
                return Err(Error::InvalidDefinition(format!(
                    "{name}: status {to} requires a pid"
                )));
            }

            state.status = to;
            if to.has_process() {
                state.pid = pid.or(state.pid);
                if to == Status::Starting {
                    state.started_at = Some(Utc::now());
                }
                Ok((from, None))
            } else {
                state.pid = None;
                state.started_at = None;
                state.consecutive_failures = 0;
                let old_health = std::mem::take(&mut state.health);
                Ok((from, (old_health != HealthStatus::Unknown).then_some(old_health)))
            }
        })?;

        if from != to {
            debug!("Service {} status: {} -> {}", name, from, to);
            self.publish(cell.id(), &name, ChangeKind::StatusChanged { from, to });
        }
        if let Some(old) = health_change {
            self.publish(
                cell.id(),
                &name,
                ChangeKind::HealthChanged {
                    from: old,
                    to: HealthStatus::Unknown,
                },
            );
        }
        Ok(from)
    }

    /// Record a health verdict; returns the previous value if it changed
    pub fn set_health(&self, cell: &ServiceCell, health: HealthStatus) -> Option<HealthStatus> {
        let previous = cell.with_state(|state| {
            let previous = state.health;
            state.health = health;
            previous
        });
        if previous == health {
            return None;
        }
        let name = cell.name();
        debug!("Service {} health: {} -> {}", name, previous, health);
        self.publish(
            cell.id(),
            &name,
            ChangeKind::HealthChanged {
                from: previous,
                to: health,
            },
        );
        Some(previous)
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Drop a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.len())
            .field("bus", &self.bus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str) -> Service {
        Service::new(name, name, BuildSystem::Npm)
    }

    #[smol_potat::test]
    async fn test_add_rejects_duplicates() {
        let registry = Registry::in_memory();
        registry.add_service(svc("api")).await.unwrap();

        assert!(matches!(
            registry.add_service(svc("api")).await,
            Err(Error::DuplicateId(_))
        ));

        let mut renamed = svc("other");
        renamed.name = "api".into();
        assert!(matches!(
            registry.add_service(renamed).await,
            Err(Error::DuplicateName(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[smol_potat::test]
    async fn test_dependencies_must_exist_and_be_acyclic() {
        let registry = Registry::in_memory();
        let db = svc("db");
        let api = svc("api").depends_on(db.id);

        assert!(matches!(
            registry.add_service(api.clone()).await,
            Err(Error::MissingDependency { .. })
        ));

        registry.add_services(vec![api.clone(), db.clone()]).await.unwrap();

        let err = registry
            .set_dependencies(db.id, vec![DependencyEdge::new(db.id, api.id)])
            .await
            .unwrap_err();
        match err {
            Error::DependencyCycle { names, .. } => assert_eq!(names, vec!["api", "db"]),
            other => panic!("expected cycle, got {other}"),
        }
        assert!(registry.get(db.id).unwrap().definition().dependencies.is_empty());
    }

    #[smol_potat::test]
    async fn test_delete_with_dependents() {
        let registry = Registry::in_memory();
        let db = svc("db");
        let api = svc("api").depends_on(db.id);
        registry.add_services(vec![db.clone(), api.clone()]).await.unwrap();

        match registry.delete_service(db.id, false).await {
            Err(Error::DependentsExist { dependents, .. }) => assert_eq!(dependents, vec!["api"]),
            other => panic!("expected DependentsExist, got {other:?}"),
        }

        registry.delete_service(db.id, true).await.unwrap();
        assert!(registry.get(db.id).is_err());
        assert!(registry.get(api.id).unwrap().definition().dependencies.is_empty());
    }

    #[smol_potat::test]
    async fn test_status_changes_keep_pid_invariant() {
        let registry = Registry::in_memory();
        let cell = registry.add_service(svc("api")).await.unwrap();
        let sub = registry.subscribe();

        assert!(registry.set_status(&cell, Status::Starting, None).is_err());
        registry.set_status(&cell, Status::Starting, Some(99)).unwrap();
        registry.set_status(&cell, Status::Running, None).unwrap();
        assert_eq!(cell.pid(), Some(99));

        registry.set_health(&cell, HealthStatus::Healthy);
        registry.set_status(&cell, Status::Crashed, None).unwrap();
        assert_eq!(cell.pid(), None);
        assert_eq!(cell.health(), HealthStatus::Unknown);

        assert!(matches!(
            registry.set_status(&cell, Status::Running, Some(1)),
            Err(Error::InvalidTransition { .. })
        ));

        let kinds: Vec<ChangeKind> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::StatusChanged {
                    from: Status::Stopped,
                    to: Status::Starting
                },
                ChangeKind::StatusChanged {
                    from: Status::Starting,
                    to: Status::Running
                },
                ChangeKind::HealthChanged {
                    from: HealthStatus::Unknown,
                    to: HealthStatus::Healthy
                },
                ChangeKind::StatusChanged {
                    from: Status::Running,
                    to: Status::Crashed
                },
                ChangeKind::HealthChanged {
                    from: HealthStatus::Healthy,
                    to: HealthStatus::Unknown
                },
            ]
        );
    }

    #[smol_potat::test]
    async fn test_update_keeps_runtime_state() {
        let registry = Registry::in_memory();
        let cell = registry.add_service(svc("api")).await.unwrap();
        registry.set_status(&cell, Status::Starting, Some(7)).unwrap();

        let updated = svc("api").with_port(8081);
        registry.update_service(updated).await.unwrap();

        let cell = registry.get_by_name("api").unwrap();
        assert_eq!(cell.definition().port, Some(8081));
        assert_eq!(cell.status(), Status::Starting);
    }
}
