//! Data models for the service registry

use chrono::{DateTime, Utc};
use process_launcher::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Stable service identifier
pub type ServiceId = Uuid;

const SERVICE_NAMESPACE: Uuid = Uuid::from_u128(0x6465_7673_7461_636b_2d73_6572_7669_6365);

/// Deterministic id for a service name, so re-importing a stack file keeps ids
pub fn service_id_for_name(name: &str) -> ServiceId {
    Uuid::new_v5(&SERVICE_NAMESPACE, name.as_bytes())
}

/// Build tool used to run a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildSystem {
    /// `mvn spring-boot:run` style projects
    Maven,
    /// Gradle projects run through `bootRun`
    Gradle,
    /// npm projects run through `npm start`
    Npm,
    /// Cargo projects run through `cargo run`
    Cargo,
    /// An arbitrary shell command
    Shell {
        /// Command line passed to `sh -c`
        command: String,
    },
}

impl BuildSystem {
    /// Short lower-case name
    pub fn name(&self) -> &'static str {
        match self {
            BuildSystem::Maven => "maven",
            BuildSystem::Gradle => "gradle",
            BuildSystem::Npm => "npm",
            BuildSystem::Cargo => "cargo",
            BuildSystem::Shell { .. } => "shell",
        }
    }
}

fn default_true() -> bool {
    true
}

/// A declared dependency of one service on another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The dependent service
    pub from: ServiceId,
    /// The service that must be up first
    pub to: ServiceId,
    /// Whether `from` may not start unless `to` is running
    #[serde(default = "default_true")]
    pub required: bool,
    /// Whether `to` must additionally report healthy
    #[serde(default)]
    pub health_check_required: bool,
    /// How long to wait for `to` before giving up; engine default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

impl DependencyEdge {
    /// A required edge without a health requirement
    pub fn new(from: ServiceId, to: ServiceId) -> Self {
        Self {
            from,
            to,
            required: true,
            health_check_required: false,
            wait_ms: None,
        }
    }

    /// Require the target to be healthy
    pub fn healthy(mut self) -> Self {
        self.health_check_required = true;
        self
    }

    /// Mark the edge as optional
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Override the wait duration
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_ms = Some(wait.as_millis() as u64);
        self
    }

    /// Wait duration for this edge, if overridden
    pub fn wait(&self) -> Option<Duration> {
        self.wait_ms.map(Duration::from_millis)
    }
}

/// A service definition
///
/// Definitions are immutable once registered; updates replace the whole
/// value. Runtime state lives in [`crate::ServiceCell`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Unique service identifier
    pub id: ServiceId,
    /// Unique human readable name
    pub name: String,
    /// Source directory, relative paths resolve against the projects dir
    pub directory: PathBuf,
    /// How to build and run it
    pub build: BuildSystem,
    /// Port the service listens on
    #[serde(default)]
    pub port: Option<u16>,
    /// HTTP health endpoint
    #[serde(default)]
    pub health_url: Option<String>,
    /// Outgoing dependency edges
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
    /// Tie-break among independent services, lower starts first
    #[serde(default)]
    pub order: i32,
    /// Service level environment overrides
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Service {
    /// Create a service with an id derived from its name
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, build: BuildSystem) -> Self {
        let name = name.into();
        Self {
            id: service_id_for_name(&name),
            name,
            directory: directory.into(),
            build,
            port: None,
            health_url: None,
            dependencies: Vec::new(),
            order: 0,
            env: BTreeMap::new(),
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the health URL
    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    /// Set the order hint
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a required dependency on `target`
    pub fn depends_on(mut self, target: ServiceId) -> Self {
        self.dependencies.push(DependencyEdge::new(self.id, target));
        self
    }

    /// Add a fully specified dependency edge; `from` is rewritten to this service
    pub fn with_dependency(mut self, mut edge: DependencyEdge) -> Self {
        edge.from = self.id;
        self.dependencies.push(edge);
        self
    }

    /// Ids this service depends on
    pub fn dependency_ids(&self) -> impl Iterator<Item = ServiceId> + '_ {
        self.dependencies.iter().map(|edge| edge.to)
    }
}

/// Lifecycle status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Not running
    #[default]
    Stopped,
    /// Process spawned, not yet confirmed
    Starting,
    /// Process running
    Running,
    /// Stop in progress
    Stopping,
    /// Process exited unexpectedly or failed to spawn
    Crashed,
}

impl Status {
    /// Whether a process is expected to exist in this status
    pub fn has_process(&self) -> bool {
        matches!(self, Status::Starting | Status::Running | Status::Stopping)
    }

    /// Check if a transition is allowed
    pub fn can_transition_to(&self, to: Status) -> bool {
        use Status::*;

        match (self, to) {
            // Forced stop is always allowed
            (_, Stopped) => true,

            (Stopped, Starting) | (Crashed, Starting) => true,
            (Starting, Running) => true,
            (Starting, Stopping) | (Running, Stopping) => true,

            // Exits before or after confirmation, and spawn failures
            (Starting, Crashed) | (Running, Crashed) | (Stopped, Crashed) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Stopped => "stopped",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Health as seen by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Not probed yet
    #[default]
    Unknown,
    /// Last debounced verdict was healthy
    Healthy,
    /// Failure threshold reached
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Resource snapshot for a running service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Resident set size of the root process in bytes
    pub memory_bytes: Option<u64>,
    /// Seconds since the current process started
    pub uptime_secs: Option<u64>,
    /// Automatic restarts since the last manual start
    pub restart_attempts: u32,
    /// Lines currently held in the log ring
    pub buffered_log_lines: usize,
    /// When the snapshot was taken
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Kind of an uptime event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UptimeEventKind {
    /// Process launched
    Started,
    /// Process stopped on request
    Stopped,
    /// Process exited unexpectedly or failed to spawn
    Crashed,
    /// Health flipped to healthy
    Healthy,
    /// Health flipped to unhealthy
    Unhealthy,
}

impl UptimeEventKind {
    /// Events that open a downtime interval
    pub fn is_failure(&self) -> bool {
        matches!(self, UptimeEventKind::Crashed | UptimeEventKind::Unhealthy)
    }
}

/// An immutable entry in a service's uptime log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UptimeEvent {
    /// Service the event belongs to
    pub service_id: ServiceId,
    /// What happened
    pub kind: UptimeEventKind,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

impl UptimeEvent {
    /// Create an event stamped now
    pub fn now(service_id: ServiceId, kind: UptimeEventKind) -> Self {
        Self::at(service_id, kind, Utc::now())
    }

    /// Create an event with an explicit timestamp
    pub fn at(service_id: ServiceId, kind: UptimeEventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            service_id,
            kind,
            timestamp,
        }
    }
}

/// Filter for captured log lines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    /// Minimum level to include
    #[serde(default)]
    pub min_level: Option<LogLevel>,
    /// Only lines captured at or after this instant
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Only lines containing this text
    #[serde(default)]
    pub contains: Option<String>,
    /// Return at most this many of the most recent matches
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LogQuery {
    /// Whether a line passes the filter (limit is applied separately)
    pub fn matches(&self, line: &process_launcher::OutputLine) -> bool {
        self.min_level.is_none_or(|min| line.level >= min)
            && self.since.is_none_or(|since| line.timestamp >= since)
            && self
                .contains
                .as_deref()
                .is_none_or(|needle| line.line.contains(needle))
    }

    /// Apply the filter and limit to lines in chronological order
    pub fn apply<'a, I>(&self, lines: I) -> Vec<process_launcher::OutputLine>
    where
        I: DoubleEndedIterator<Item = &'a process_launcher::OutputLine>,
    {
        let limit = self.limit.unwrap_or(usize::MAX);
        let mut out: Vec<_> = lines
            .rev()
            .filter(|line| self.matches(line))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }
}

/// A point-in-time view of a service for callers outside the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceView {
    /// The definition
    pub service: Service,
    /// Lifecycle status
    pub status: Status,
    /// Health
    pub health: HealthStatus,
    /// Root process id while a process exists
    pub pid: Option<u32>,
    /// When the current process was launched
    pub started_at: Option<DateTime<Utc>>,
    /// Latest metrics
    pub metrics: MetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use process_launcher::{LogSource, OutputLine};

    #[test]
    fn test_status_transitions() {
        use Status::*;

        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Crashed));
        assert!(Crashed.can_transition_to(Starting));
        assert!(Crashed.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Crashed));
        assert!(Running.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Crashed.can_transition_to(Running));
    }

    #[test]
    fn test_ids_are_stable_per_name() {
        assert_eq!(service_id_for_name("api"), service_id_for_name("api"));
        assert_ne!(service_id_for_name("api"), service_id_for_name("web"));
        assert_eq!(Service::new("api", "api", BuildSystem::Maven).id, service_id_for_name("api"));
    }

    #[test]
    fn test_dependency_builder_sets_from() {
        let db = Service::new("db", "db", BuildSystem::Cargo);
        let api = Service::new("api", "api", BuildSystem::Maven)
            .with_dependency(DependencyEdge::new(Uuid::nil(), db.id).healthy());
        assert_eq!(api.dependencies[0].from, api.id);
        assert!(api.dependencies[0].health_check_required);
        assert!(api.dependencies[0].required);
    }

    #[test]
    fn test_log_query_keeps_most_recent() {
        let lines: Vec<_> = ["one", "WARN two", "three", "ERROR four"]
            .iter()
            .map(|l| OutputLine::new(LogSource::Stdout, *l))
            .collect();

        let query = LogQuery {
            limit: Some(2),
            ..Default::default()
        };
        let got = query.apply(lines.iter());
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].line, "three");
        assert_eq!(got[1].line, "ERROR four");

        let query = LogQuery {
            min_level: Some(LogLevel::Warn),
            ..Default::default()
        };
        let got = query.apply(lines.iter());
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].line, "WARN two");
    }

    #[test]
    fn test_build_system_serde_shape() {
        let json = serde_json::to_value(BuildSystem::Shell {
            command: "./run.sh".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "shell");
        assert_eq!(json["command"], "./run.sh");
    }
}
