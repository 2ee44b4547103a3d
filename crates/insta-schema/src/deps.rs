use crate::compose::{ComposeServiceSpec, DependencyCondition};
use crate::loader::ComposeGraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// A `depends_on` relation between two container identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source: String,
    pub target: String,
    pub condition: DependencyCondition,
}

/// Reachability queries over a [`ComposeGraph`].
///
/// Answers "what is reachable", never "in what order": startup sequencing
/// stays with the backend's compose implementation. Every query walks the
/// graph afresh; nothing is cached between calls.
#[derive(Debug, Clone, Copy)]
pub struct DependencyResolver<'g> {
    graph: &'g ComposeGraph,
}

impl<'g> DependencyResolver<'g> {
    pub fn new(graph: &'g ComposeGraph) -> Self {
        Self { graph }
    }

    /// Transitive dependencies of `target` as container identities, in
    /// breadth-first discovery order without duplicates.
    ///
    /// `target` may be a logical name or a container identity. A target
    /// absent from the graph has no dependencies.
    pub fn resolve(&self, target: &str, include_self: bool) -> Vec<String> {
        let mut seen = HashSet::new();
        self.resolve_services(target, include_self)
            .into_iter()
            .map(|name| self.graph.container_identity(&name).to_owned())
            .filter(|identity| seen.insert(identity.clone()))
            .collect()
    }

    /// Same traversal as [`resolve`](Self::resolve), returning logical
    /// service names. Dependency names missing from the graph are leaves.
    pub fn resolve_services(&self, target: &str, include_self: bool) -> Vec<String> {
        let Some(root) = self.lookup(target) else {
            return if include_self {
                vec![target.to_owned()]
            } else {
                Vec::new()
            };
        };

        let mut visited: HashSet<&str> = HashSet::from([root.name.as_str()]);
        let mut queue: VecDeque<&str> = VecDeque::from([root.name.as_str()]);
        let mut out = Vec::new();
        if include_self {
            out.push(root.name.clone());
        }

        while let Some(current) = queue.pop_front() {
            let Some(spec) = self.graph.get(current) else {
                continue;
            };
            for dep in spec.dependency_names() {
                if visited.insert(dep) {
                    out.push(dep.to_owned());
                    queue.push_back(dep);
                }
            }
        }
        out
    }

    /// Container identities of services that list `target` directly in
    /// their `depends_on`, sorted by service name.
    pub fn dependents(&self, target: &str) -> Vec<String> {
        let name = self.lookup(target).map_or(target, |s| s.name.as_str());
        let mut seen = HashSet::new();
        self.graph
            .iter()
            .filter(|spec| spec.dependency_names().any(|d| d == name))
            .map(|spec| spec.container_identity().to_owned())
            .filter(|identity| seen.insert(identity.clone()))
            .collect()
    }

    /// Every edge in the graph, by container identity.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.graph
            .iter()
            .flat_map(|spec| {
                spec.depends_on.iter().map(move |dep| DependencyEdge {
                    source: spec.container_identity().to_owned(),
                    target: self.graph.container_identity(&dep.service).to_owned(),
                    condition: dep.condition,
                })
            })
            .collect()
    }

    fn lookup(&self, target: &str) -> Option<&'g ComposeServiceSpec> {
        self.graph
            .get(target)
            .or_else(|| self.graph.iter().find(|s| s.container_identity() == target))
    }
}
