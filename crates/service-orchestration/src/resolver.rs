//! Dependency resolution with a per-scope order cache
//!
//! Shutdown must mirror the startup order exactly, even if definitions
//! change in between, so the last computed order for each scope is kept.

use service_registry::{DependencyGraph, GraphIssue, Registry, ServiceId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::Result;

type ScopeKey = Option<BTreeSet<ServiceId>>;

/// Computes start/stop orders and tiers from registry definitions
#[derive(Debug, Default)]
pub struct Resolver {
    last_orders: Mutex<HashMap<ScopeKey, Vec<ServiceId>>>,
}

fn cycle_error(graph: &DependencyGraph, ids: Vec<ServiceId>) -> crate::Error {
    let names = ids
        .iter()
        .map(|id| graph.name_of(id).unwrap_or_default().to_string())
        .collect();
    service_registry::Error::DependencyCycle { ids, names }.into()
}

impl Resolver {
    /// Create a resolver with an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Topological start order over `scope` (all services when `None`)
    pub fn order(&self, registry: &Registry, scope: Option<&BTreeSet<ServiceId>>) -> Result<Vec<ServiceId>> {
        let graph = registry.graph();
        let order = match graph.order(scope) {
            Ok(order) => order,
            Err(GraphIssue::Cycle { ids }) => return Err(cycle_error(&graph, ids)),
            Err(GraphIssue::MissingTarget { from, to }) => {
                return Err(service_registry::Error::MissingDependency {
                    service: graph.name_of(&from).unwrap_or_default().to_string(),
                    target: to,
                }
                .into());
            }
        };
        debug!("Resolved start order of {} services", order.len());
        self.last_orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.cloned(), order.clone());
        Ok(order)
    }

    /// Exact reverse of the last order computed for `scope`.
    ///
    /// Resolves afresh when the scope was never ordered or its members have
    /// changed since.
    pub fn reverse_order(
        &self,
        registry: &Registry,
        scope: Option<&BTreeSet<ServiceId>>,
    ) -> Result<Vec<ServiceId>> {
        let cached = self
            .last_orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&scope.cloned())
            .cloned();
        let members = registry.graph().members(scope);
        let mut order = match cached {
            Some(order)
                if order.len() == members.len() && order.iter().all(|id| members.contains(id)) =>
            {
                order
            }
            _ => self.order(registry, scope)?,
        };
        order.reverse();
        Ok(order)
    }

    /// Structural problems within `scope`
    pub fn validate(&self, registry: &Registry, scope: Option<&BTreeSet<ServiceId>>) -> Vec<GraphIssue> {
        registry.graph().validate(scope)
    }

    /// Start order grouped by dependency depth
    pub fn tiers(&self, registry: &Registry, scope: Option<&BTreeSet<ServiceId>>) -> Result<Vec<Vec<ServiceId>>> {
        let graph = registry.graph();
        match graph.tiers(scope) {
            Ok(tiers) => {
                let flat: Vec<ServiceId> = tiers.iter().flatten().copied().collect();
                self.last_orders
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(scope.cloned(), flat);
                Ok(tiers)
            }
            Err(GraphIssue::Cycle { ids }) => Err(cycle_error(&graph, ids)),
            Err(GraphIssue::MissingTarget { from, to }) => Err(service_registry::Error::MissingDependency {
                service: graph.name_of(&from).unwrap_or_default().to_string(),
                target: to,
            }
            .into()),
        }
    }
}
