//! Auto-grouping: a graph rewrite that merges compatible same-kind
//! resources
//!
//! The strategy ([`AutoGrouper`]) decides which vertex pairs are
//! candidates and how parallel edges merge; the driver owns the graph
//! mutation. Grouping is a pure rewrite: running the grouped graph is
//! semantically identical to running every grouped child individually,
//! and the grouping parent is responsible for that equivalence.

mod base;

pub use base::BaseAutoGrouper;

use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::graph::{Graph, NodeIndex};
use crate::resource::{BoxedRes, Edge};

/// Pluggable grouping strategy.
///
/// The driver moves resources and rewires edges; the strategy proposes
/// candidate pairs, vetoes them, and merges parallel edge attributes.
pub trait AutoGrouper: Send {
    fn name(&self) -> &str;

    /// Inspect the initial graph and build candidate state.
    fn init(&mut self, graph: &Graph<BoxedRes, Edge>) -> EngineResult<()>;

    /// Next candidate pair `(survivor, absorbed)`, or `None` when the
    /// current round is exhausted.
    fn vertex_next(
        &mut self,
        graph: &Graph<BoxedRes, Edge>,
    ) -> EngineResult<Option<(NodeIndex, NodeIndex)>>;

    /// Strategy-level veto for a candidate pair.
    fn vertex_cmp(
        &self,
        graph: &Graph<BoxedRes, Edge>,
        v1: NodeIndex,
        v2: NodeIndex,
    ) -> EngineResult<()>;

    /// Merge two parallel edges produced by redirection.
    fn edge_merge(&self, e1: &Edge, e2: &Edge) -> Edge;

    /// Called after every candidate attempt with whether a merge
    /// happened; returning `false` terminates the rewrite.
    fn vertex_test(&mut self, graph: &Graph<BoxedRes, Edge>, changed: bool)
        -> EngineResult<bool>;
}

/// Run the grouping rewrite to fixpoint under the given strategy.
pub fn auto_group(
    graph: &mut Graph<BoxedRes, Edge>,
    grouper: &mut dyn AutoGrouper,
) -> EngineResult<()> {
    grouper.init(graph)?;
    let before = graph.num_vertices();
    loop {
        let pair = grouper.vertex_next(graph)?;
        let mut changed = false;
        if let Some((v1, v2)) = pair {
            if candidate_ok(graph, grouper, v1, v2) {
                merge_pair(graph, grouper, v1, v2)?;
                changed = true;
            } else {
                trace!(grouper = grouper.name(), "candidate pair rejected");
            }
        }
        if !grouper.vertex_test(graph, changed)? {
            break;
        }
    }
    debug!(
        grouper = grouper.name(),
        before,
        after = graph.num_vertices(),
        "auto-grouping complete"
    );
    Ok(())
}

fn candidate_ok(
    graph: &Graph<BoxedRes, Edge>,
    grouper: &dyn AutoGrouper,
    v1: NodeIndex,
    v2: NodeIndex,
) -> bool {
    if v1 == v2 || !graph.contains(v1) || !graph.contains(v2) {
        return false;
    }
    if grouper.vertex_cmp(graph, v1, v2).is_err() {
        return false;
    }
    let (r1, r2) = match (graph.vertex(v1), graph.vertex(v2)) {
        (Some(r1), Some(r2)) => (r1, r2),
        _ => return false,
    };
    // hidden resources are placeholders and never group
    if r1.meta().hidden || r2.meta().hidden {
        return false;
    }
    let g1 = match r1.as_groupable() {
        Some(g) => g,
        None => return false,
    };
    let g2 = match r2.as_groupable() {
        Some(g) => g,
        None => return false,
    };
    if g1.auto_group_meta().disabled || g2.auto_group_meta().disabled {
        return false;
    }
    if g1.group_cmp(r2.as_ref()).is_err() {
        return false;
    }
    // grouping must not introduce a cycle: any indirect path between the
    // pair becomes a loop once they collapse
    if graph.reachable_skipping_direct(v1, v2, true)
        || graph.reachable_skipping_direct(v2, v1, true)
    {
        return false;
    }
    true
}

/// Absorb `v2` into `v1`: redirect every edge touching `v2`, remove the
/// vertex, and hand its resource to the survivor's `group_res`.
fn merge_pair(
    graph: &mut Graph<BoxedRes, Edge>,
    grouper: &dyn AutoGrouper,
    v1: NodeIndex,
    v2: NodeIndex,
) -> EngineResult<()> {
    for (src, eix) in graph.in_edges(v2) {
        if src == v1 {
            continue; // the intra-pair edge disappears with the merge
        }
        let edge = match graph.edge(eix) {
            Some(e) => e.clone(),
            None => continue,
        };
        match graph.find_edge(src, v1) {
            Some(existing) => {
                let merged = match graph.edge(existing) {
                    Some(e) => grouper.edge_merge(e, &edge),
                    None => edge,
                };
                if let Some(slot) = graph.edge_mut(existing) {
                    *slot = merged;
                }
            }
            None => {
                graph.add_edge(src, v1, edge);
            }
        }
    }
    for (dst, eix) in graph.out_edges(v2) {
        if dst == v1 {
            continue;
        }
        let edge = match graph.edge(eix) {
            Some(e) => e.clone(),
            None => continue,
        };
        match graph.find_edge(v1, dst) {
            Some(existing) => {
                let merged = match graph.edge(existing) {
                    Some(e) => grouper.edge_merge(e, &edge),
                    None => edge,
                };
                if let Some(slot) = graph.edge_mut(existing) {
                    *slot = merged;
                }
            }
            None => {
                graph.add_edge(v1, dst, edge);
            }
        }
    }

    let absorbed = graph
        .remove_vertex(v2)
        .ok_or_else(|| EngineError::Internal("absorbed vertex vanished mid-merge".to_string()))?;
    let survivor = graph
        .vertex_mut(v1)
        .ok_or_else(|| EngineError::Internal("survivor vertex vanished mid-merge".to_string()))?;
    let groupable = survivor.as_groupable_mut().ok_or_else(|| {
        EngineError::Internal("survivor lost the groupable capability".to_string())
    })?;
    groupable.group_res(absorbed)
}
