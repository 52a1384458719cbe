//! Default grouping strategy
//!
//! Proposes every same-kind groupable pair, one round at a time. After a
//! successful merge the candidate set is rebuilt from the rewritten
//! graph, so chains of merges converge to a single survivor per group.

use crate::error::EngineResult;
use crate::graph::{Graph, NodeIndex};
use crate::resource::{BoxedRes, Edge};

use super::AutoGrouper;

/// Same-kind pair strategy with cycle safety left to the driver.
#[derive(Default)]
pub struct BaseAutoGrouper {
    pairs: Vec<(NodeIndex, NodeIndex)>,
}

impl BaseAutoGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    fn scan(graph: &Graph<BoxedRes, Edge>) -> Vec<(NodeIndex, NodeIndex)> {
        let candidates: Vec<(NodeIndex, &str)> = graph
            .vertices()
            .filter(|(_, res)| {
                !res.meta().hidden
                    && res
                        .as_groupable()
                        .map(|g| !g.auto_group_meta().disabled)
                        .unwrap_or(false)
            })
            .map(|(ix, res)| (ix, res.kind()))
            .collect();
        let mut pairs = Vec::new();
        for (i, (v1, kind1)) in candidates.iter().enumerate() {
            for (v2, kind2) in candidates.iter().skip(i + 1) {
                if kind1 == kind2 {
                    pairs.push((*v1, *v2));
                }
            }
        }
        // queue order: pop from the back
        pairs.reverse();
        pairs
    }
}

impl AutoGrouper for BaseAutoGrouper {
    fn name(&self) -> &str {
        "non-reachability"
    }

    fn init(&mut self, graph: &Graph<BoxedRes, Edge>) -> EngineResult<()> {
        self.pairs = Self::scan(graph);
        Ok(())
    }

    fn vertex_next(
        &mut self,
        graph: &Graph<BoxedRes, Edge>,
    ) -> EngineResult<Option<(NodeIndex, NodeIndex)>> {
        while let Some((v1, v2)) = self.pairs.pop() {
            if graph.contains(v1) && graph.contains(v2) {
                return Ok(Some((v1, v2)));
            }
        }
        Ok(None)
    }

    fn vertex_cmp(
        &self,
        graph: &Graph<BoxedRes, Edge>,
        v1: NodeIndex,
        v2: NodeIndex,
    ) -> EngineResult<()> {
        let kind1 = graph.vertex(v1).map(|r| r.kind());
        let kind2 = graph.vertex(v2).map(|r| r.kind());
        if kind1.is_some() && kind1 == kind2 {
            Ok(())
        } else {
            Err(crate::error::EngineError::Validate(
                "cannot group across kinds".to_string(),
            ))
        }
    }

    fn edge_merge(&self, e1: &Edge, e2: &Edge) -> Edge {
        let merged = Edge::new(e1.name.clone(), e1.notify || e2.notify);
        merged.set_refresh(e1.refresh() || e2.refresh());
        merged
    }

    fn vertex_test(
        &mut self,
        graph: &Graph<BoxedRes, Edge>,
        changed: bool,
    ) -> EngineResult<bool> {
        if changed {
            // the graph was rewritten; start a fresh round over it
            self.pairs = Self::scan(graph);
            return Ok(true);
        }
        Ok(!self.pairs.is_empty())
    }
}
