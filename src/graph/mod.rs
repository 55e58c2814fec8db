//! Dependency graph of planned nodes.
//!
//! Edges point from a dependent to its dependency: `from → to` means `to` must
//! be applied before `from`. Three kinds of edge exist:
//!
//! - [`EdgeKind::Explicit`]: listed in `depends_on`
//! - [`EdgeKind::Parent`]: a child resource depends on its owner
//! - [`EdgeKind::Reference`]: inferred from a `${nodes.ID.KEY}` placeholder in a
//!   node's properties, location or tags
//!
//! Cycle detection runs before ordering and reports the full path
//! (`a → b → a`). Ordering uses Kahn's algorithm with an ordered ready-queue, so
//! the same graph always yields the same order regardless of insertion order.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::core::StackError;
use crate::planner::PlannedNode;
use crate::utils::did_you_mean;

/// Why one node depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeKind {
    /// Declared in `depends_on`
    Explicit,
    /// Child on owning parent
    Parent,
    /// Inferred from an output reference
    Reference,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "depends_on"),
            Self::Parent => write!(f, "parent"),
            Self::Reference => write!(f, "reference"),
        }
    }
}

/// Color states for cycle detection using DFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Directed dependency graph keyed by qualified node id.
#[derive(Debug, Clone, Default)]
pub struct DeploymentGraph {
    graph: DiGraph<String, EdgeKind>,
    node_map: BTreeMap<String, NodeIndex>,
}

impl DeploymentGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for a set of planned nodes and reject cycles.
    ///
    /// Every edge target must be one of `nodes`; anything else is a
    /// [`StackError::DanglingReference`].
    pub fn build<'a, I>(nodes: I) -> Result<Self, StackError>
    where
        I: IntoIterator<Item = &'a PlannedNode>,
    {
        let nodes: Vec<&PlannedNode> = nodes.into_iter().collect();
        let mut graph = Self::new();
        for node in &nodes {
            graph.add_node(&node.id);
        }

        for node in &nodes {
            for (target, kind) in node.dependencies() {
                if !graph.contains(&target) {
                    let hint = did_you_mean(&target, graph.node_map.keys().map(String::as_str));
                    return Err(StackError::DanglingReference {
                        from: node.id.clone(),
                        target: target.clone(),
                        reason: format!("which is not part of the plan{hint}"),
                    });
                }
                graph.add_dependency(&node.id, &target, kind);
            }
        }

        graph.detect_cycles()?;
        tracing::debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Built deployment graph"
        );
        Ok(graph)
    }

    /// Add a node if it is not present yet.
    pub fn add_node(&mut self, id: &str) -> NodeIndex {
        if let Some(&index) = self.node_map.get(id) {
            index
        } else {
            let index = self.graph.add_node(id.to_string());
            self.node_map.insert(id.to_string(), index);
            index
        }
    }

    /// `from` depends on `to`. Duplicate edges keep the first kind.
    pub fn add_dependency(&mut self, from: &str, to: &str, kind: EdgeKind) {
        let from_idx = self.add_node(from);
        let to_idx = self.add_node(to);
        if !self.graph.contains_edge(from_idx, to_idx) {
            self.graph.add_edge(from_idx, to_idx, kind);
        }
    }

    /// Whether `id` is a node of the graph.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.node_map.contains_key(id)
    }

    /// Detect cycles using DFS with colors.
    pub fn detect_cycles(&self) -> Result<(), StackError> {
        let mut colors: BTreeMap<NodeIndex, Color> =
            self.graph.node_indices().map(|n| (n, Color::White)).collect();
        let mut path: Vec<NodeIndex> = Vec::new();

        // Visit in id order so the reported cycle is stable
        for index in self.node_map.values() {
            if matches!(colors.get(index), Some(Color::White))
                && let Some(cycle) = self.dfs_visit(*index, &mut colors, &mut path)
            {
                let cycle = cycle.iter().map(|i| self.graph[*i].as_str()).collect::<Vec<_>>().join(" → ");
                return Err(StackError::CyclicDependency {
                    cycle,
                });
            }
        }
        Ok(())
    }

    fn dfs_visit(
        &self,
        node: NodeIndex,
        colors: &mut BTreeMap<NodeIndex, Color>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for neighbor in self.sorted_neighbors(node, Direction::Outgoing) {
            match colors.get(&neighbor) {
                Some(Color::Gray) => {
                    let start = path.iter().position(|n| *n == neighbor).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(neighbor);
                    return Some(cycle);
                }
                Some(Color::White) => {
                    if let Some(cycle) = self.dfs_visit(neighbor, colors, path) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        None
    }

    fn sorted_neighbors(&self, node: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        neighbors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        neighbors.dedup();
        neighbors
    }

    /// Apply order: every node after all of its dependencies, ties broken by id.
    pub fn topological_order(&self) -> Result<Vec<String>, StackError> {
        self.detect_cycles()?;

        let mut remaining: BTreeMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Outgoing).count()))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| self.graph[*n].as_str())
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            let index = self.node_map[id];
            for dependent in self.graph.neighbors_directed(index, Direction::Incoming) {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(self.graph[dependent].as_str());
                    }
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(StackError::Other {
                message: "Failed to determine apply order".to_string(),
            });
        }
        Ok(order)
    }

    /// Direct dependencies of `id` with the edge kind, sorted by id.
    #[must_use]
    pub fn direct_dependencies(&self, id: &str) -> Vec<(String, EdgeKind)> {
        let Some(&index) = self.node_map.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<(String, EdgeKind)> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| {
                use petgraph::visit::EdgeRef;
                (self.graph[edge.target()].clone(), *edge.weight())
            })
            .collect();
        deps.sort();
        deps
    }

    /// Nodes that depend on `id` directly, sorted and deduplicated.
    #[must_use]
    pub fn direct_dependents(&self, id: &str) -> Vec<String> {
        let Some(&index) = self.node_map.get(id) else {
            return Vec::new();
        };
        let dependents: BTreeSet<String> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect();
        dependents.into_iter().collect()
    }

    /// Nodes that depend on `id`, directly or indirectly.
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut dependents = BTreeSet::new();
        let Some(&start) = self.node_map.get(id) else {
            return dependents;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for neighbor in self.graph.neighbors_directed(current, Direction::Incoming) {
                if dependents.insert(self.graph[neighbor].clone()) {
                    queue.push_back(neighbor);
                }
            }
        }
        dependents
    }

    /// Nodes nothing depends on, sorted by id. These start the tree rendering.
    #[must_use]
    pub fn roots(&self) -> Vec<String> {
        self.node_map
            .iter()
            .filter(|(_, index)| {
                self.graph.neighbors_directed(**index, Direction::Incoming).next().is_none()
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Total number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Total number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Render the dependency tree under `root`.
    #[must_use]
    pub fn to_tree_string(&self, root: &str) -> String {
        let mut result = String::new();
        let mut visited = BTreeSet::new();
        result.push_str(root);
        result.push('\n');
        self.build_tree_string(root, &mut result, "", &mut visited);
        result
    }

    fn build_tree_string(
        &self,
        node: &str,
        result: &mut String,
        prefix: &str,
        visited: &mut BTreeSet<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        let deps = self.direct_dependencies(node);
        for (i, (dep, kind)) in deps.iter().enumerate() {
            let is_last = i == deps.len() - 1;
            let connector = if is_last {
                "└── "
            } else {
                "├── "
            };
            let seen = if visited.contains(dep) {
                " (see above)"
            } else {
                ""
            };
            result.push_str(&format!("{prefix}{connector}{dep} [{kind}]{seen}\n"));
            let child_prefix = if is_last {
                format!("{prefix}    ")
            } else {
                format!("{prefix}│   ")
            };
            self.build_tree_string(dep, result, &child_prefix, visited);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)], nodes: &[&str]) -> DeploymentGraph {
        let mut graph = DeploymentGraph::new();
        for node in nodes {
            graph.add_node(node);
        }
        for (from, to) in edges {
            graph.add_dependency(from, to, EdgeKind::Explicit);
        }
        graph
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    #[test]
    fn test_simple_dependency_chain() {
        let g = graph(&[("a", "b"), ("b", "c")], &[]);
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_diamond_dependency() {
        let g = graph(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")], &[]);
        let order = g.topological_order().unwrap();
        assert!(position(&order, "d") < position(&order, "b"));
        assert!(position(&order, "d") < position(&order, "c"));
        assert!(position(&order, "b") < position(&order, "a"));
        assert!(position(&order, "c") < position(&order, "a"));
    }

    #[test]
    fn test_order_is_stable_by_id() {
        let a = graph(&[], &["zeta", "alpha", "mid"]).topological_order().unwrap();
        let b = graph(&[], &["mid", "zeta", "alpha"]).topological_order().unwrap();
        assert_eq!(a, vec!["alpha", "mid", "zeta"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_circular_dependency_detection() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a")], &[]);
        let err = g.topological_order().unwrap_err();
        match err {
            StackError::CyclicDependency {
                cycle,
            } => assert_eq!(cycle, "a → b → c → a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let g = graph(&[("a", "a")], &[]);
        assert!(matches!(g.detect_cycles(), Err(StackError::CyclicDependency { .. })));
    }

    #[test]
    fn test_transitive_dependents() {
        let g = graph(&[("d", "c"), ("e", "d"), ("f", "x")], &["c"]);
        let dependents = g.transitive_dependents("c");
        assert_eq!(dependents, BTreeSet::from(["d".to_string(), "e".to_string()]));
        assert!(g.transitive_dependents("e").is_empty());
    }

    #[test]
    fn test_tree_string() {
        let mut g = DeploymentGraph::new();
        g.add_dependency("subscription", "topic", EdgeKind::Parent);
        g.add_dependency("subscription", "storage", EdgeKind::Reference);
        g.add_dependency("topic", "storage", EdgeKind::Reference);
        assert_eq!(g.roots(), vec!["subscription".to_string()]);
        let tree = g.to_tree_string("subscription");
        assert!(tree.starts_with("subscription\n"));
        assert!(tree.contains("├── storage [reference]"));
        assert!(tree.contains("└── topic [parent]"));
        assert!(tree.contains("storage [reference] (see above)"));
    }

    #[test]
    fn test_duplicate_edges_ignored() {
        let mut g = DeploymentGraph::new();
        g.add_dependency("a", "b", EdgeKind::Reference);
        g.add_dependency("a", "b", EdgeKind::Explicit);
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.direct_dependencies("a"), vec![("b".to_string(), EdgeKind::Reference)]);
    }
}
