//! Per-service outcome reports for batch operations

use serde::{Deserialize, Serialize};
use service_registry::ServiceId;

/// Which batch produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    /// `start_all`
    Start,
    /// `stop_all`
    Stop,
}

/// What happened to one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Process launched
    Started {
        /// Root pid
        pid: u32,
    },
    /// Nothing to do, it was already running
    AlreadyRunning,
    /// Process stopped
    Stopped {
        /// Whether SIGKILL was needed
        forced: bool,
    },
    /// Nothing to do, it was not running
    AlreadyStopped,
    /// The operation failed
    Failed {
        /// Error message
        error: String,
    },
    /// Not attempted because an earlier start failed
    Skipped,
}

impl Outcome {
    /// Whether the outcome counts as success
    pub fn is_ok(&self) -> bool {
        !matches!(self, Outcome::Failed { .. } | Outcome::Skipped)
    }
}

/// Outcome for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOutcome {
    /// Service id
    pub id: ServiceId,
    /// Service name
    pub name: String,
    /// What happened
    pub outcome: Outcome,
}

/// Report of a batch start or stop, in the order services were visited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Which batch
    pub operation: BatchOperation,
    /// One entry per service in scope
    pub outcomes: Vec<ServiceOutcome>,
}

impl BatchReport {
    /// Empty report
    pub fn new(operation: BatchOperation) -> Self {
        Self {
            operation,
            outcomes: Vec::new(),
        }
    }

    /// Append an outcome
    pub fn push(&mut self, id: ServiceId, name: impl Into<String>, outcome: Outcome) {
        self.outcomes.push(ServiceOutcome {
            id,
            name: name.into(),
            outcome,
        });
    }

    /// Whether every service succeeded
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.outcome.is_ok())
    }

    /// Outcomes that failed
    pub fn failed(&self) -> impl Iterator<Item = &ServiceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Failed { .. }))
    }

    /// Outcomes that were skipped
    pub fn skipped(&self) -> impl Iterator<Item = &ServiceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == Outcome::Skipped)
    }

    /// Outcome for a service
    pub fn outcome_of(&self, id: ServiceId) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.id == id)
            .map(|o| &o.outcome)
    }

    /// One-line description
    pub fn summary(&self) -> String {
        let op = match self.operation {
            BatchOperation::Start => "start",
            BatchOperation::Stop => "stop",
        };
        let failed: Vec<String> = self
            .failed()
            .map(|o| match &o.outcome {
                Outcome::Failed { error } => format!("{}: {}", o.name, error),
                _ => o.name.clone(),
            })
            .collect();
        let skipped = self.skipped().count();
        format!(
            "batch {} failed for {} service(s) [{}], {} skipped",
            op,
            failed.len(),
            failed.join("; "),
            skipped
        )
    }
}
