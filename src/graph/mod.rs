//! Generic directed acyclic graph primitive
//!
//! Thin layer over `petgraph::StableDiGraph`: stable indices survive
//! removals, which the auto-grouper and the online graph swap both rely
//! on. Adds deterministic toposort and a cycle diagnostic that names the
//! offending vertices for [`GraphError::Cycle`] payloads.

use std::collections::VecDeque;
use std::fmt;

use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use thiserror::Error;

pub use petgraph::stable_graph::{EdgeIndex, NodeIndex};

/// Graph structure failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The graph is not acyclic; payload names one offending cycle
    #[error("graph contains a cycle: [{}]", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// Two inequivalent resources share a `(kind, name)` key
    #[error("duplicate resource: {0}")]
    DuplicateResource(String),

    /// Same key, both Compatible, but `adapts` rejected the pair
    #[error("incompatible duplicate resources: {0}")]
    IncompatibleDuplicate(String),

    /// An export `(kind, name, host)` triple was produced twice
    #[error("duplicate export: {0} to host {1}")]
    DuplicateExport(String, String),

    /// An edge references a vertex that does not exist
    #[error("missing vertex: {0}")]
    MissingVertex(String),
}

/// A directed graph with typed vertices and edges
pub struct Graph<V, E> {
    name: String,
    inner: StableDiGraph<V, E>,
}

impl<V, E> Graph<V, E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: StableDiGraph::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_vertex(&mut self, vertex: V) -> NodeIndex {
        self.inner.add_node(vertex)
    }

    /// Remove a vertex and every edge touching it.
    pub fn remove_vertex(&mut self, ix: NodeIndex) -> Option<V> {
        self.inner.remove_node(ix)
    }

    pub fn vertex(&self, ix: NodeIndex) -> Option<&V> {
        self.inner.node_weight(ix)
    }

    pub fn vertex_mut(&mut self, ix: NodeIndex) -> Option<&mut V> {
        self.inner.node_weight_mut(ix)
    }

    pub fn contains(&self, ix: NodeIndex) -> bool {
        self.inner.contains_node(ix)
    }

    pub fn vertices(&self) -> impl Iterator<Item = (NodeIndex, &V)> {
        self.inner
            .node_indices()
            .filter_map(move |ix| self.inner.node_weight(ix).map(|v| (ix, v)))
    }

    pub fn vertex_indices(&self) -> Vec<NodeIndex> {
        self.inner.node_indices().collect()
    }

    pub fn num_vertices(&self) -> usize {
        self.inner.node_count()
    }

    pub fn num_edges(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn add_edge(&mut self, a: NodeIndex, b: NodeIndex, edge: E) -> EdgeIndex {
        self.inner.add_edge(a, b, edge)
    }

    /// First edge from `a` to `b`, if any.
    pub fn find_edge(&self, a: NodeIndex, b: NodeIndex) -> Option<EdgeIndex> {
        self.inner.find_edge(a, b)
    }

    pub fn edge(&self, ix: EdgeIndex) -> Option<&E> {
        self.inner.edge_weight(ix)
    }

    pub fn edge_mut(&mut self, ix: EdgeIndex) -> Option<&mut E> {
        self.inner.edge_weight_mut(ix)
    }

    pub fn edge_endpoints(&self, ix: EdgeIndex) -> Option<(NodeIndex, NodeIndex)> {
        self.inner.edge_endpoints(ix)
    }

    pub fn remove_edge(&mut self, ix: EdgeIndex) -> Option<E> {
        self.inner.remove_edge(ix)
    }

    pub fn edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex, &E)> {
        self.inner
            .edge_references()
            .map(|e| (e.source(), e.target(), e.weight()))
    }

    pub fn edge_indices(&self) -> Vec<EdgeIndex> {
        self.inner.edge_indices().collect()
    }

    /// Downstream neighbors of `ix`.
    pub fn outgoing(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        self.inner
            .neighbors_directed(ix, Direction::Outgoing)
            .collect()
    }

    /// Upstream neighbors of `ix`.
    pub fn incoming(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        self.inner
            .neighbors_directed(ix, Direction::Incoming)
            .collect()
    }

    /// Outgoing edges as `(target, edge index)` pairs.
    pub fn out_edges(&self, ix: NodeIndex) -> Vec<(NodeIndex, EdgeIndex)> {
        self.inner
            .edges_directed(ix, Direction::Outgoing)
            .map(|e| (e.target(), e.id()))
            .collect()
    }

    /// Incoming edges as `(source, edge index)` pairs.
    pub fn in_edges(&self, ix: NodeIndex) -> Vec<(NodeIndex, EdgeIndex)> {
        self.inner
            .edges_directed(ix, Direction::Incoming)
            .map(|e| (e.source(), e.id()))
            .collect()
    }

    /// Whether `to` is reachable from `from`, optionally ignoring direct
    /// `from -> to` edges. The auto-grouper uses the skip variant to ask
    /// "would merging these two endpoints create a cycle".
    pub fn reachable_skipping_direct(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        skip_direct: bool,
    ) -> bool {
        let mut seen = vec![from];
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            for next in self.inner.neighbors_directed(node, Direction::Outgoing) {
                if skip_direct && node == from && next == to {
                    continue;
                }
                if next == to {
                    return true;
                }
                if !seen.contains(&next) {
                    seen.push(next);
                    queue.push_back(next);
                }
            }
        }
        false
    }

    pub fn reachable(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.reachable_skipping_direct(from, to, false)
    }
}

impl<V: fmt::Display, E> Graph<V, E> {
    /// Topological sort, deterministic for a given insertion order.
    ///
    /// On failure the error payload names one offending cycle.
    pub fn topo_sort(&self) -> Result<Vec<NodeIndex>, GraphError> {
        match petgraph::algo::toposort(&self.inner, None) {
            Ok(order) => Ok(order),
            Err(_) => {
                let cycle = self.cycle().unwrap_or_default();
                let names = cycle
                    .iter()
                    .filter_map(|ix| self.inner.node_weight(*ix))
                    .map(|v| v.to_string())
                    .collect();
                Err(GraphError::Cycle(names))
            }
        }
    }

    /// One cycle in the graph, as an ordered vertex list, or `None` when
    /// the graph is acyclic. Self-loops count.
    pub fn cycle(&self) -> Option<Vec<NodeIndex>> {
        for ix in self.inner.node_indices() {
            if self.inner.find_edge(ix, ix).is_some() {
                return Some(vec![ix]);
            }
        }
        for scc in petgraph::algo::kosaraju_scc(&self.inner) {
            if scc.len() > 1 {
                return Some(self.order_cycle(scc));
            }
        }
        None
    }

    /// Order the members of a strongly-connected component by walking
    /// successor edges within the component.
    fn order_cycle(&self, scc: Vec<NodeIndex>) -> Vec<NodeIndex> {
        let mut ordered = Vec::with_capacity(scc.len());
        let mut current = match scc.first() {
            Some(first) => *first,
            None => return ordered,
        };
        while ordered.len() < scc.len() {
            ordered.push(current);
            let next = self
                .inner
                .neighbors_directed(current, Direction::Outgoing)
                .find(|n| scc.contains(n) && !ordered.contains(n));
            match next {
                Some(n) => current = n,
                None => break,
            }
        }
        ordered
    }

    /// Graphviz dump, used by swap tracing and tests.
    pub fn to_dot(&self) -> String {
        let mut out = format!("digraph \"{}\" {{\n", self.name);
        for ix in self.inner.node_indices() {
            if let Some(v) = self.inner.node_weight(ix) {
                out.push_str(&format!("\t\"{}\";\n", v));
            }
        }
        for e in self.inner.edge_references() {
            if let (Some(a), Some(b)) = (
                self.inner.node_weight(e.source()),
                self.inner.node_weight(e.target()),
            ) {
                out.push_str(&format!("\t\"{}\" -> \"{}\";\n", a, b));
            }
        }
        out.push_str("}\n");
        out
    }
}

impl<V: fmt::Debug, E: fmt::Debug> fmt::Debug for Graph<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("vertices", &self.inner.node_count())
            .field("edges", &self.inner.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toposort_orders_dependencies_first() {
        let mut g: Graph<&str, ()> = Graph::new("t");
        let a = g.add_vertex("a");
        let b = g.add_vertex("b");
        let c = g.add_vertex("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        let order = g.topo_sort().unwrap_or_default();
        let pos = |ix| order.iter().position(|o| *o == ix);
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn cycle_diagnostic_names_members() {
        let mut g: Graph<&str, ()> = Graph::new("t");
        let a = g.add_vertex("a");
        let b = g.add_vertex("b");
        g.add_edge(a, b, ());
        g.add_edge(b, a, ());
        match g.topo_sort() {
            Err(GraphError::Cycle(names)) => {
                assert_eq!(names.len(), 2);
                assert!(names.contains(&"a".to_string()));
                assert!(names.contains(&"b".to_string()));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn reachability_skips_direct_edges_on_request() {
        let mut g: Graph<&str, ()> = Graph::new("t");
        let a = g.add_vertex("a");
        let b = g.add_vertex("b");
        let c = g.add_vertex("c");
        g.add_edge(a, b, ());
        assert!(g.reachable(a, b));
        assert!(!g.reachable_skipping_direct(a, b, true));
        g.add_edge(a, c, ());
        g.add_edge(c, b, ());
        assert!(g.reachable_skipping_direct(a, b, true));
    }

    #[test]
    fn stable_indices_survive_removal() {
        let mut g: Graph<&str, ()> = Graph::new("t");
        let a = g.add_vertex("a");
        let b = g.add_vertex("b");
        let c = g.add_vertex("c");
        g.remove_vertex(b);
        assert!(g.contains(a));
        assert!(g.contains(c));
        assert_eq!(g.num_vertices(), 2);
    }
}
