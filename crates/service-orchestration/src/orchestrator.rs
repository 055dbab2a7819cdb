//! The orchestration facade
//!
//! [`Orchestrator`] ties the registry, resolver, supervisor, health monitor,
//! port reclaimer and uptime tracker together behind one cloneable handle.

use async_channel::Receiver;
use futures::future::join_all;
use process_launcher::OutputLine;
use service_registry::{
    DependencyEdge, GraphIssue, HealthStatus, LogQuery, MemoryStore, MetricsSnapshot,
    ProfileContext, RecordStore, Registry, RegistrySettings, Retention, Service, ServiceCell,
    ServiceId, ServiceView, Status, Subscription, SubscriptionId,
};
use smol::Task;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{BatchMode, EngineConfig};
use crate::health::{HealthMonitor, HealthSettings, HttpProber, Prober};
use crate::ports::{CleanupResult, PortReclaimer, PortScanner, SystemPortScanner, port_in_use};
use crate::report::{BatchOperation, BatchReport, Outcome};
use crate::resolver::Resolver;
use crate::runner::{BuildRunner, DefaultBuildRunner};
use crate::supervisor::{CrashNotice, StopOutcome, Supervisor};
use crate::uptime::{UptimeStats, UptimeTracker};
use crate::{Error, Result};

const PORT_RELEASE: Duration = Duration::from_secs(1);
const PORT_POLL: Duration = Duration::from_millis(50);

/// Assembles an [`Orchestrator`] with its collaborators
pub struct OrchestratorBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn RecordStore>>,
    prober: Arc<dyn Prober>,
    scanner: Arc<dyn PortScanner>,
    runner: Arc<dyn BuildRunner>,
}

impl OrchestratorBuilder {
    /// Builder with HTTP probes, `lsof`/`ss` port scanning and an in-memory store
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            prober: Arc::new(HttpProber),
            scanner: Arc::new(SystemPortScanner),
            runner: Arc::new(DefaultBuildRunner),
        }
    }

    /// Persist records in `store`
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the health prober
    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    /// Replace the port scanner
    pub fn port_scanner(mut self, scanner: Arc<dyn PortScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Replace the build runner
    pub fn build_runner(mut self, runner: Arc<dyn BuildRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Validate the configuration and wire everything up.
    ///
    /// Must be called from within a smol executor context since it spawns
    /// the crash handler.
    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn RecordStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::with_retention(Retention {
                uptime_per_service: config.uptime_capacity,
                ..Retention::default()
            })),
        };
        let registry = Arc::new(Registry::new(
            store.clone(),
            RegistrySettings {
                log_capacity: config.log_capacity,
                subscriber_buffer: config.subscriber_buffer,
            },
        ));
        let tracker = Arc::new(UptimeTracker::with_store(
            config.uptime_capacity,
            store.clone(),
        ));
        let (supervisor, notices) = Supervisor::new(
            registry.clone(),
            tracker.clone(),
            self.runner,
            config.persist_logs.then(|| store.clone()),
        );
        let health = HealthMonitor::new(
            registry.clone(),
            tracker.clone(),
            self.prober,
            HealthSettings {
                interval: config.health_interval(),
                timeout: config.health_timeout(),
                failure_threshold: config.failure_threshold,
            },
        );
        let reclaimer = PortReclaimer::new(self.scanner, config.port_kill_grace());

        let inner = Arc::new(Inner {
            config,
            registry,
            tracker,
            resolver: Resolver::new(),
            supervisor,
            health,
            reclaimer,
            contexts: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            crash_handler: Mutex::new(None),
        });
        let handler = smol::spawn(handle_crashes(Arc::downgrade(&inner), notices));
        *inner
            .crash_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);

        Ok(Orchestrator { inner })
    }
}

struct Inner {
    config: EngineConfig,
    registry: Arc<Registry>,
    tracker: Arc<UptimeTracker>,
    resolver: Resolver,
    supervisor: Supervisor,
    health: HealthMonitor,
    reclaimer: PortReclaimer,
    // Context of the last start per service, reused by restarts
    contexts: Mutex<HashMap<ServiceId, ProfileContext>>,
    shutting_down: AtomicBool,
    crash_handler: Mutex<Option<Task<()>>>,
}

impl Inner {
    fn ensure_accepting(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn remember(&self, id: ServiceId, ctx: &ProfileContext) {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ctx.clone());
    }

    fn context_of(&self, id: ServiceId) -> ProfileContext {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Directory a service runs in: absolute paths as-is, relative ones
    /// against the profile override or the global projects dir
    fn work_dir(&self, service: &Service, ctx: &ProfileContext) -> PathBuf {
        if service.directory.is_absolute() {
            return service.directory.clone();
        }
        match ctx
            .projects_dir_override
            .as_ref()
            .or(self.config.projects_dir.as_ref())
        {
            Some(base) => base.join(&service.directory),
            None => service.directory.clone(),
        }
    }

    /// Service values win over profile values, which win over global ones
    fn merged_env(&self, service: &Service, ctx: &ProfileContext) -> BTreeMap<String, String> {
        let mut env = self.config.env.clone();
        env.extend(ctx.env_overrides.clone());
        env.extend(service.env.clone());
        env
    }

    async fn wait_for_dependencies(&self, service: &Service) -> Result<()> {
        for edge in &service.dependencies {
            let dependency = match self.registry.get(edge.to) {
                Ok(cell) => cell,
                Err(_) if !edge.required => continue,
                Err(_) => {
                    return Err(service_registry::Error::MissingDependency {
                        service: service.name.clone(),
                        target: edge.to,
                    }
                    .into());
                }
            };
            if !edge.required {
                if !dependency_ready(&dependency, edge) {
                    debug!(
                        "Optional dependency {} of {} is not ready, continuing",
                        dependency.name(),
                        service.name
                    );
                }
                continue;
            }

            let wait = edge.wait().unwrap_or(self.config.dependency_wait());
            let deadline = Instant::now() + wait;
            let mut logged = false;
            while !dependency_ready(&dependency, edge) {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::DependencyNotReady {
                        service: service.name.clone(),
                        dependency: dependency.name(),
                        reason: format!(
                            "status {}, health {} after {:?}",
                            dependency.status(),
                            dependency.health(),
                            wait
                        ),
                    });
                }
                if !logged {
                    info!(
                        "{} waiting up to {:?} for {}",
                        service.name,
                        wait,
                        dependency.name()
                    );
                    logged = true;
                }
                smol::Timer::after(self.config.dependency_poll().min(deadline - now)).await;
            }
        }
        Ok(())
    }

    async fn reclaim_port(&self, cell: &ServiceCell, service: &Service) -> Result<()> {
        let Some(port) = service.port else {
            return Ok(());
        };
        if !port_in_use(port) {
            return Ok(());
        }
        warn!("Port {} for {} is occupied, reclaiming", port, service.name);
        let cleanup = match self.reclaimer.cleanup(port, cell.pid()).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Could not scan port {}: {}", port, e);
                CleanupResult {
                    port,
                    ..Default::default()
                }
            }
        };

        let deadline = Instant::now() + PORT_RELEASE;
        while port_in_use(port) {
            if Instant::now() >= deadline {
                return Err(Error::PortConflict {
                    service: service.name.clone(),
                    port,
                    cleanup,
                });
            }
            smol::Timer::after(PORT_POLL).await;
        }
        Ok(())
    }

    /// Dependency check, port reclaim, spawn and health registration.
    /// The caller holds the service's operation guard.
    async fn launch(&self, cell: &Arc<ServiceCell>, ctx: &ProfileContext) -> Result<u32> {
        let service = cell.definition();
        self.wait_for_dependencies(&service).await?;
        self.reclaim_port(cell, &service).await?;

        let work_dir = self.work_dir(&service, ctx);
        let env = self.merged_env(&service, ctx);
        let pid = self.supervisor.start(cell, &env, &work_dir).await?;
        if cell.status() == Status::Running {
            self.health.register(cell.clone()).await;
        }
        Ok(pid)
    }

    async fn stop_locked(&self, cell: &ServiceCell) -> Result<Outcome> {
        self.health.deregister(cell.id());
        let outcome = self
            .supervisor
            .stop(cell, self.config.stop_timeout())
            .await?;
        Ok(match outcome {
            StopOutcome::NotRunning => Outcome::AlreadyStopped,
            StopOutcome::Graceful => Outcome::Stopped { forced: false },
            StopOutcome::ForceKilled => Outcome::Stopped { forced: true },
        })
    }

    async fn start_service(&self, id: ServiceId, ctx: &ProfileContext) -> Result<Outcome> {
        self.ensure_accepting()?;
        let cell = self.registry.get(id)?;
        let Some(_guard) = cell.try_begin_operation() else {
            return Err(Error::AlreadyInProgress {
                service: cell.name(),
            });
        };
        if matches!(cell.status(), Status::Starting | Status::Running) {
            debug!("{} is already running", cell.name());
            return Ok(Outcome::AlreadyRunning);
        }

        self.remember(id, ctx);
        cell.with_state(|s| s.restart_attempts = 0);
        let pid = self.launch(&cell, ctx).await?;
        Ok(Outcome::Started { pid })
    }

    async fn stop_service(&self, id: ServiceId) -> Result<Outcome> {
        let cell = self.registry.get(id)?;
        let Some(_guard) = cell.try_begin_operation() else {
            return Err(Error::AlreadyInProgress {
                service: cell.name(),
            });
        };
        self.stop_locked(&cell).await
    }

    async fn stop_all(&self, scope: Option<&BTreeSet<ServiceId>>) -> Result<BatchReport> {
        let order = self.resolver.reverse_order(&self.registry, scope)?;
        let mut report = BatchReport::new(BatchOperation::Stop);
        for id in order {
            let Ok(cell) = self.registry.get(id) else {
                debug!("Service {} is gone, skipping stop", id);
                continue;
            };
            let outcome = match self.stop_service(id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Failed to stop {}: {}", cell.name(), e);
                    Outcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            report.push(id, cell.name(), outcome);
        }
        Ok(report)
    }
}

fn dependency_ready(dependency: &ServiceCell, edge: &DependencyEdge) -> bool {
    let state = dependency.state();
    state.status == Status::Running
        && (!edge.health_check_required || state.health == HealthStatus::Healthy)
}

async fn handle_crashes(inner: Weak<Inner>, notices: Receiver<CrashNotice>) {
    while let Ok(notice) = notices.recv().await {
        let Some(strong) = inner.upgrade() else {
            break;
        };
        if !strong.config.restart.enabled || strong.shutting_down.load(Ordering::SeqCst) {
            continue;
        }
        drop(strong);
        smol::spawn(auto_restart(inner.clone(), notice)).detach();
    }
}

/// Restart a crashed service with backoff until it launches or the budget is spent
async fn auto_restart(inner: Weak<Inner>, notice: CrashNotice) {
    let id = notice.service_id;
    loop {
        let delay = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let Ok(cell) = inner.registry.get(id) else {
                return;
            };
            let max = inner.config.restart.max_retries;
            let attempt = cell.with_state(|s| {
                (s.restart_attempts < max).then(|| {
                    s.restart_attempts += 1;
                    s.restart_attempts
                })
            });
            let Some(attempt) = attempt else {
                error!(
                    "Service {} ({}) crashed and exhausted {} restart(s), leaving it crashed",
                    cell.name(),
                    id,
                    max
                );
                return;
            };
            let delay = inner.config.restart.backoff(attempt);
            info!(
                "Restarting {} in {:?} (attempt {}/{})",
                cell.name(),
                delay,
                attempt,
                max
            );
            delay
        };
        smol::Timer::after(delay).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Ok(cell) = inner.registry.get(id) else {
            return;
        };
        if cell.status() != Status::Crashed {
            debug!("{} is {} again, restart not needed", cell.name(), cell.status());
            return;
        }
        let Some(_guard) = cell.try_begin_operation() else {
            debug!("{} has an operation in flight, restart abandoned", cell.name());
            return;
        };
        let ctx = inner.context_of(id);
        match inner.launch(&cell, &ctx).await {
            Ok(pid) => {
                info!("Service {} restarted with pid {}", cell.name(), pid);
                return;
            }
            Err(e) => {
                warn!("Restart of {} failed: {}", cell.name(), e);
                if cell.status() != Status::Crashed {
                    return;
                }
            }
        }
    }
}

/// Handle to the orchestration engine
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Engine with default collaborators and an in-memory store
    pub fn new(config: EngineConfig) -> Result<Self> {
        OrchestratorBuilder::new(config).build()
    }

    /// Builder for injecting collaborators
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Load persisted services, edges and uptime history
    pub async fn load(&self) -> Result<usize> {
        let count = self.inner.registry.load().await?;
        let ids = self.inner.registry.cells().iter().map(|c| c.id()).collect::<Vec<_>>();
        let events = self.inner.tracker.load(ids).await?;
        info!("Loaded {} service(s) and {} uptime event(s)", count, events);
        Ok(count)
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The underlying registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// The uptime tracker
    pub fn tracker(&self) -> &Arc<UptimeTracker> {
        &self.inner.tracker
    }

    // Lifecycle

    /// Start one service.
    ///
    /// Fails fast with [`Error::AlreadyInProgress`] if another lifecycle
    /// operation on the service is running; returns once the process is
    /// launched.
    pub async fn start_service(&self, id: ServiceId, ctx: &ProfileContext) -> Result<Outcome> {
        self.inner.start_service(id, ctx).await
    }

    /// Stop one service; stopping a stopped service succeeds without effect
    pub async fn stop_service(&self, id: ServiceId) -> Result<Outcome> {
        self.inner.stop_service(id).await
    }

    /// Stop then start under one operation guard
    pub async fn restart_service(&self, id: ServiceId, ctx: &ProfileContext) -> Result<Outcome> {
        self.inner.ensure_accepting()?;
        let cell = self.inner.registry.get(id)?;
        let Some(_guard) = cell.try_begin_operation() else {
            return Err(Error::AlreadyInProgress {
                service: cell.name(),
            });
        };
        info!("Restarting {} ({})", cell.name(), id);
        self.inner.stop_locked(&cell).await?;
        self.inner.remember(id, ctx);
        cell.with_state(|s| s.restart_attempts = 0);
        let pid = self.inner.launch(&cell, ctx).await?;
        Ok(Outcome::Started { pid })
    }

    /// Start every service in scope in dependency order.
    ///
    /// The first failure aborts the batch; services not yet attempted are
    /// reported as skipped. Nothing already started is rolled back.
    pub async fn start_all(&self, ctx: &ProfileContext) -> Result<BatchReport> {
        self.inner.ensure_accepting()?;
        let scope = ctx.service_ids.as_ref();
        let mut report = BatchReport::new(BatchOperation::Start);
        let tiers = match self.inner.config.batch_mode {
            BatchMode::Sequential => self
                .inner
                .resolver
                .order(&self.inner.registry, scope)?
                .into_iter()
                .map(|id| vec![id])
                .collect(),
            BatchMode::Tiered => self.inner.resolver.tiers(&self.inner.registry, scope)?,
        };
        info!(
            "Starting {} service(s) in {} step(s)",
            tiers.iter().map(Vec::len).sum::<usize>(),
            tiers.len()
        );

        let mut aborted = false;
        for tier in tiers {
            if aborted {
                for id in tier {
                    report.push(id, self.name_of(id), Outcome::Skipped);
                }
                continue;
            }
            let results = join_all(tier.iter().map(|id| self.inner.start_service(*id, ctx))).await;
            for (id, result) in tier.into_iter().zip(results) {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Failed to start {}: {}", self.name_of(id), e);
                        aborted = true;
                        Outcome::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                report.push(id, self.name_of(id), outcome);
            }
        }

        if report.is_success() {
            Ok(report)
        } else {
            Err(Error::PartialBatchFailure(report))
        }
    }

    /// Stop every service in scope in the exact reverse of the last start order.
    ///
    /// Best effort: every service is attempted and all failures are reported.
    pub async fn stop_all(&self, ctx: &ProfileContext) -> Result<BatchReport> {
        let report = self.inner.stop_all(ctx.service_ids.as_ref()).await?;
        if report.is_success() {
            Ok(report)
        } else {
            Err(Error::PartialBatchFailure(report))
        }
    }

    /// Stop health loops, stop everything within the deadline, then force
    /// kill whatever is left
    pub async fn shutdown(&self) -> Result<BatchReport> {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::SeqCst);
        let cancelled = inner.health.cancel_all();
        info!("Shutting down ({} probe loop(s) cancelled)", cancelled);

        let deadline = inner.config.shutdown_deadline();
        let stopped = smol::future::or(async { Some(inner.stop_all(None).await) }, async {
            smol::Timer::after(deadline).await;
            None
        })
        .await;

        let mut report = match stopped {
            Some(Ok(report)) => report,
            Some(Err(e)) => {
                warn!("Orderly stop failed: {}", e);
                BatchReport::new(BatchOperation::Stop)
            }
            None => {
                warn!("Shutdown deadline of {:?} exceeded", deadline);
                BatchReport::new(BatchOperation::Stop)
            }
        };

        for cell in inner.registry.cells() {
            if !(inner.supervisor.is_supervised(cell.id()) || cell.status().has_process()) {
                continue;
            }
            match inner.supervisor.force_kill(&cell).await {
                Ok(true) => {
                    report.outcomes.retain(|o| o.id != cell.id());
                    report.push(cell.id(), cell.name(), Outcome::Stopped { forced: true });
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to kill {}: {}", cell.name(), e);
                    report.push(
                        cell.id(),
                        cell.name(),
                        Outcome::Failed {
                            error: e.to_string(),
                        },
                    );
                }
            }
        }

        let handler = inner
            .crash_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(handler);
        info!("Shutdown complete");
        Ok(report)
    }

    // Queries

    /// Views of every service in registration order
    pub fn services(&self) -> Vec<ServiceView> {
        self.inner.registry.cells().iter().map(|c| c.view()).collect()
    }

    /// View of one service
    pub fn service(&self, id: ServiceId) -> Result<ServiceView> {
        Ok(self.inner.registry.get(id)?.view())
    }

    /// View of one service by name
    pub fn service_by_name(&self, name: &str) -> Result<ServiceView> {
        Ok(self.inner.registry.get_by_name(name)?.view())
    }

    /// Captured output held in memory
    pub fn logs(&self, id: ServiceId, query: &LogQuery) -> Result<Vec<OutputLine>> {
        Ok(self.inner.registry.get(id)?.logs(query))
    }

    /// Captured output from the record store
    pub async fn stored_logs(&self, id: ServiceId, query: &LogQuery) -> Result<Vec<OutputLine>> {
        Ok(self.inner.registry.store().query_logs(id, query).await?)
    }

    /// Latest metrics snapshot
    pub fn metrics(&self, id: ServiceId) -> Result<MetricsSnapshot> {
        Ok(self.inner.registry.get(id)?.view().metrics)
    }

    /// Availability over the trailing `window`
    pub fn stats(&self, id: ServiceId, window: Duration) -> Result<UptimeStats> {
        self.inner.registry.get(id)?;
        Ok(self.inner.tracker.stats(id, window))
    }

    /// Probe a running service now
    pub async fn check_now(&self, id: ServiceId) -> Result<HealthStatus> {
        let cell = self.inner.registry.get(id)?;
        self.inner.health.check_now(&cell).await
    }

    /// Terminate whatever listens on `port`
    pub async fn cleanup_port(&self, port: u16) -> Result<CleanupResult> {
        self.inner.reclaimer.cleanup(port, None).await
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> Subscription {
        self.inner.registry.subscribe()
    }

    /// Drop a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.registry.unsubscribe(id)
    }

    /// Structural problems of the dependency graph within `scope`
    pub fn validate(&self, scope: Option<&BTreeSet<ServiceId>>) -> Vec<GraphIssue> {
        self.inner.resolver.validate(&self.inner.registry, scope)
    }

    /// Start order within `scope`
    pub fn order(&self, scope: Option<&BTreeSet<ServiceId>>) -> Result<Vec<ServiceId>> {
        self.inner.resolver.order(&self.inner.registry, scope)
    }

    /// Start order grouped into dependency tiers
    pub fn tiers(&self, scope: Option<&BTreeSet<ServiceId>>) -> Result<Vec<Vec<ServiceId>>> {
        self.inner.resolver.tiers(&self.inner.registry, scope)
    }

    // Registry mutations

    /// Register a service
    pub async fn add_service(&self, service: Service) -> Result<ServiceId> {
        Ok(self.inner.registry.add_service(service).await?.id())
    }

    /// Register several services validated as one batch
    pub async fn add_services(&self, services: Vec<Service>) -> Result<Vec<ServiceId>> {
        let cells = self.inner.registry.add_services(services).await?;
        Ok(cells.iter().map(|c| c.id()).collect())
    }

    /// Replace a definition; a running process picks it up on its next start
    pub async fn update_service(&self, service: Service) -> Result<()> {
        Ok(self.inner.registry.update_service(service).await?)
    }

    /// Replace a service's outgoing dependency edges
    pub async fn set_dependencies(&self, id: ServiceId, edges: Vec<DependencyEdge>) -> Result<()> {
        Ok(self.inner.registry.set_dependencies(id, edges).await?)
    }

    /// Remove a service, stopping it first if it runs.
    ///
    /// Rejected while other services depend on it unless `force`.
    pub async fn delete_service(&self, id: ServiceId, force: bool) -> Result<Service> {
        let cell = self.inner.registry.get(id)?;
        let Some(_guard) = cell.try_begin_operation() else {
            return Err(Error::AlreadyInProgress {
                service: cell.name(),
            });
        };
        let graph = self.inner.registry.graph();
        let dependents = graph.dependents_of(&id);
        if !dependents.is_empty() && !force {
            return Err(service_registry::Error::DependentsExist {
                service: cell.name(),
                dependents: dependents
                    .iter()
                    .map(|d| graph.name_of(d).unwrap_or_default().to_string())
                    .collect(),
            }
            .into());
        }
        if cell.status() != Status::Stopped {
            self.inner.stop_locked(&cell).await?;
        }
        let service = self.inner.registry.delete_service(id, force).await?;
        self.inner.tracker.forget(id);
        self.inner
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(service)
    }

    fn name_of(&self, id: ServiceId) -> String {
        self.inner
            .registry
            .get(id)
            .map(|c| c.name())
            .unwrap_or_else(|_| id.to_string())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("services", &self.inner.registry.len())
            .field(
                "shutting_down",
                &self.inner.shutting_down.load(Ordering::SeqCst),
            )
            .finish()
    }
}
