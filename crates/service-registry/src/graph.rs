//! Dependency graph over service definitions
//!
//! The graph is built from a snapshot of immutable definitions and never
//! touches runtime state. Every query accepts an optional scope; edges to
//! services outside the scope are ignored.

use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};

use crate::models::{Service, ServiceId};

/// Structural problem found by [`DependencyGraph::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphIssue {
    /// An edge points at a service that is not registered
    MissingTarget {
        /// Dependent service
        from: ServiceId,
        /// Unknown target
        to: ServiceId,
    },
    /// A strongly connected set of services
    Cycle {
        /// Every id on the cycle, in start-order tie-break order
        ids: Vec<ServiceId>,
    },
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    order: i32,
    deps: Vec<ServiceId>,
}

type SortKey = (i32, String, ServiceId);

/// Directed graph where an edge `a -> b` means `a` depends on `b`
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: IndexMap<ServiceId, Node>,
}

impl DependencyGraph {
    /// Build from definitions
    pub fn new<'a>(services: impl IntoIterator<Item = &'a Service>) -> Self {
        let nodes = services
            .into_iter()
            .map(|service| {
                let mut deps: Vec<ServiceId> = service.dependency_ids().collect();
                deps.dedup();
                (
                    service.id,
                    Node {
                        name: service.name.clone(),
                        order: service.order,
                        deps,
                    },
                )
            })
            .collect();
        Self { nodes }
    }

    /// Whether the graph knows a service
    pub fn contains(&self, id: &ServiceId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Name of a node
    pub fn name_of(&self, id: &ServiceId) -> Option<&str> {
        self.nodes.get(id).map(|n| n.name.as_str())
    }

    /// Ids that fall inside `scope` (every node when `None`)
    pub fn members(&self, scope: Option<&BTreeSet<ServiceId>>) -> BTreeSet<ServiceId> {
        self.in_scope(scope).into_iter().collect()
    }

    fn key(&self, id: ServiceId) -> SortKey {
        match self.nodes.get(&id) {
            Some(node) => (node.order, node.name.clone(), id),
            None => (i32::MAX, String::new(), id),
        }
    }

    fn in_scope(&self, scope: Option<&BTreeSet<ServiceId>>) -> Vec<ServiceId> {
        self.nodes
            .keys()
            .filter(|id| scope.is_none_or(|s| s.contains(id)))
            .copied()
            .collect()
    }

    fn scoped_deps<'a>(
        &'a self,
        id: &ServiceId,
        members: &'a BTreeSet<ServiceId>,
    ) -> impl Iterator<Item = ServiceId> + 'a {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|node| node.deps.iter())
            .filter(move |dep| members.contains(dep))
            .copied()
    }

    /// Report missing targets and every cycle within the scope
    pub fn validate(&self, scope: Option<&BTreeSet<ServiceId>>) -> Vec<GraphIssue> {
        let members = self.in_scope(scope);
        let mut issues = Vec::new();

        for id in &members {
            if let Some(node) = self.nodes.get(id) {
                for dep in &node.deps {
                    if !self.nodes.contains_key(dep) {
                        issues.push(GraphIssue::MissingTarget { from: *id, to: *dep });
                    }
                }
            }
        }

        for ids in self.cycles(&members) {
            issues.push(GraphIssue::Cycle { ids });
        }

        issues
    }

    /// Strongly connected components that form cycles (Tarjan)
    fn cycles(&self, members: &[ServiceId]) -> Vec<Vec<ServiceId>> {
        struct Tarjan<'g> {
            graph: &'g DependencyGraph,
            members: BTreeSet<ServiceId>,
            index: HashMap<ServiceId, usize>,
            lowlink: HashMap<ServiceId, usize>,
            on_stack: BTreeSet<ServiceId>,
            stack: Vec<ServiceId>,
            next: usize,
            found: Vec<Vec<ServiceId>>,
        }

        impl Tarjan<'_> {
            fn visit(&mut self, v: ServiceId) {
                self.index.insert(v, self.next);
                self.lowlink.insert(v, self.next);
                self.next += 1;
                self.stack.push(v);
                self.on_stack.insert(v);

                let deps: Vec<ServiceId> = self.graph.scoped_deps(&v, &self.members).collect();
                for w in deps {
                    if !self.index.contains_key(&w) {
                        self.visit(w);
                        let low = self.lowlink[&v].min(self.lowlink[&w]);
                        self.lowlink.insert(v, low);
                    } else if self.on_stack.contains(&w) {
                        let low = self.lowlink[&v].min(self.index[&w]);
                        self.lowlink.insert(v, low);
                    }
                }

                if self.lowlink[&v] == self.index[&v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack.remove(&w);
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    let self_loop = component.len() == 1
                        && self.graph.scoped_deps(&v, &self.members).any(|d| d == v);
                    if component.len() > 1 || self_loop {
                        component.sort_by_key(|id| self.graph.key(*id));
                        self.found.push(component);
                    }
                }
            }
        }

        let mut tarjan = Tarjan {
            graph: self,
            members: members.iter().copied().collect(),
            index: HashMap::new(),
            lowlink: HashMap::new(),
            on_stack: BTreeSet::new(),
            stack: Vec::new(),
            next: 0,
            found: Vec::new(),
        };

        for id in members {
            if !tarjan.index.contains_key(id) {
                tarjan.visit(*id);
            }
        }

        let mut found = tarjan.found;
        found.sort_by_key(|ids| ids.first().map(|id| self.key(*id)));
        found
    }

    /// Every id on any cycle in scope, or `None` when acyclic
    fn cycle_members(&self, members: &[ServiceId]) -> Option<Vec<ServiceId>> {
        let cycles = self.cycles(members);
        if cycles.is_empty() {
            None
        } else {
            Some(cycles.into_iter().flatten().collect())
        }
    }

    /// Topological start order: dependencies first, ties broken by order hint, name, id
    pub fn order(&self, scope: Option<&BTreeSet<ServiceId>>) -> Result<Vec<ServiceId>, GraphIssue> {
        let members = self.in_scope(scope);
        let member_set: BTreeSet<ServiceId> = members.iter().copied().collect();

        let mut remaining: HashMap<ServiceId, usize> = HashMap::new();
        let mut dependents: HashMap<ServiceId, Vec<ServiceId>> = HashMap::new();
        for id in &members {
            let deps: BTreeSet<ServiceId> = self.scoped_deps(id, &member_set).collect();
            remaining.insert(*id, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(*id);
            }
        }

        let mut ready: BTreeSet<SortKey> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| self.key(*id))
            .collect();

        let mut order = Vec::with_capacity(members.len());
        while let Some(key) = ready.pop_first() {
            let id = key.2;
            order.push(id);
            for dependent in dependents.get(&id).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(self.key(*dependent));
                    }
                }
            }
        }

        if order.len() < members.len() {
            let ids = self.cycle_members(&members).unwrap_or_default();
            return Err(GraphIssue::Cycle { ids });
        }

        Ok(order)
    }

    /// Group services by dependency depth; every tier only depends on earlier tiers
    pub fn tiers(&self, scope: Option<&BTreeSet<ServiceId>>) -> Result<Vec<Vec<ServiceId>>, GraphIssue> {
        let order = self.order(scope)?;
        let member_set: BTreeSet<ServiceId> = order.iter().copied().collect();

        let mut depth: HashMap<ServiceId, usize> = HashMap::new();
        let mut tiers: Vec<Vec<ServiceId>> = Vec::new();
        for id in order {
            let d = self
                .scoped_deps(&id, &member_set)
                .filter_map(|dep| depth.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id, d);
            if tiers.len() <= d {
                tiers.resize_with(d + 1, Vec::new);
            }
            tiers[d].push(id);
        }

        for tier in &mut tiers {
            tier.sort_by_key(|id| self.key(*id));
        }
        Ok(tiers)
    }

    /// Services that declare a dependency on `id`
    pub fn dependents_of(&self, id: &ServiceId) -> Vec<ServiceId> {
        let mut out: Vec<ServiceId> = self
            .nodes
            .iter()
            .filter(|(other, node)| *other != id && node.deps.contains(id))
            .map(|(other, _)| *other)
            .collect();
        out.sort_by_key(|other| self.key(*other));
        out
    }

    /// The given services plus everything they transitively depend on
    pub fn with_dependencies(&self, ids: impl IntoIterator<Item = ServiceId>) -> BTreeSet<ServiceId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<ServiceId> = ids.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !self.nodes.contains_key(&id) || !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.deps.iter().copied());
            }
        }
        seen
    }
}
