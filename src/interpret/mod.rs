//! Graph assembly: from produced resource and edge lists to the
//! executable DAG
//!
//! The language frontend hands over a flat `(resources, edges)` pair.
//! Assembly deduplicates or merges same-keyed resources, tracks hidden
//! variants, enforces export uniqueness, builds the edge set over the
//! cartesian product of per-key vertex groups, wires send/recv fields
//! with a type check, and validates acyclicity.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::graph::{Graph, GraphError, NodeIndex};
use crate::resource::{
    res_cmp, res_merge, BoxedRes, Edge, RecvMap, RecvWire, ResKey,
};
use crate::types::struct_fields_compatible;

/// A language-produced edge between two resource keys.
///
/// `send`/`recv` carry the field names for send/recv wiring; both or
/// neither must be present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeSpec {
    pub kind1: String,
    pub name1: String,
    pub kind2: String,
    pub name2: String,
    pub notify: bool,
    pub send: Option<String>,
    pub recv: Option<String>,
}

impl EdgeSpec {
    pub fn between(
        kind1: impl Into<String>,
        name1: impl Into<String>,
        kind2: impl Into<String>,
        name2: impl Into<String>,
    ) -> Self {
        Self {
            kind1: kind1.into(),
            name1: name1.into(),
            kind2: kind2.into(),
            name2: name2.into(),
            notify: false,
            send: None,
            recv: None,
        }
    }

    pub fn with_notify(mut self) -> Self {
        self.notify = true;
        self
    }

    pub fn with_sendrecv(mut self, send: impl Into<String>, recv: impl Into<String>) -> Self {
        self.send = Some(send.into());
        self.recv = Some(recv.into());
        self
    }

    fn key1(&self) -> ResKey {
        ResKey::new(&self.kind1, &self.name1)
    }

    fn key2(&self) -> ResKey {
        ResKey::new(&self.kind2, &self.name2)
    }
}

/// The validated executable graph plus its wiring side tables.
pub struct Assembly {
    pub graph: Graph<BoxedRes, Edge>,
    /// Per recv-side resource: recv field name to wire record.
    pub recvs: HashMap<ResKey, RecvMap>,
    /// Export records, unique by `(kind, name, host)`.
    pub exports: Vec<(ResKey, String)>,
}

/// Per-key vertex group during assembly.
#[derive(Default)]
struct Slot {
    normal: Option<BoxedRes>,
    hidden: Vec<BoxedRes>,
}

/// Assemble and validate the executable DAG.
pub fn interpret(resources: Vec<BoxedRes>, edges: Vec<EdgeSpec>) -> EngineResult<Assembly> {
    for res in &resources {
        res.meta().validate()?;
        res.validate()?;
    }

    // dedup / merge vertices by (kind, name)
    let mut order: Vec<ResKey> = Vec::new();
    let mut slots: HashMap<ResKey, Slot> = HashMap::new();
    for res in resources {
        let key = ResKey::of(res.as_ref());
        if !slots.contains_key(&key) {
            order.push(key.clone());
        }
        let slot = slots.entry(key.clone()).or_default();

        if res.meta().hidden {
            let duplicate = slot
                .hidden
                .iter()
                .any(|existing| res_cmp(existing.as_ref(), res.as_ref()).is_ok());
            if !duplicate {
                slot.hidden.push(res);
            }
            continue;
        }

        match slot.normal.take() {
            None => slot.normal = Some(res),
            Some(existing) => {
                let both_compatible =
                    existing.as_compatible().is_some() && res.as_compatible().is_some();
                if both_compatible {
                    if let Some(compatible) = existing.as_compatible() {
                        compatible.adapts(res.as_ref()).map_err(|e| {
                            EngineError::Graph(GraphError::IncompatibleDuplicate(format!(
                                "{}: {}",
                                key, e
                            )))
                        })?;
                    }
                    let merged = res_merge(vec![existing, res])?;
                    slot.normal = Some(merged);
                } else if res_cmp(existing.as_ref(), res.as_ref()).is_ok() {
                    // identical: keep the first
                    slot.normal = Some(existing);
                } else {
                    return Err(EngineError::Graph(GraphError::DuplicateResource(
                        key.to_string(),
                    )));
                }
            }
        }
    }

    // export uniqueness across all surviving resources
    let mut exports: Vec<(ResKey, String)> = Vec::new();
    let mut seen_exports: HashSet<(String, String, String)> = HashSet::new();
    for key in &order {
        if let Some(slot) = slots.get(key) {
            let all = slot.normal.iter().chain(slot.hidden.iter());
            for res in all {
                for host in &res.meta().export {
                    let triple = (key.kind.clone(), key.name.clone(), host.clone());
                    if !seen_exports.insert(triple) {
                        return Err(EngineError::Graph(GraphError::DuplicateExport(
                            key.to_string(),
                            host.clone(),
                        )));
                    }
                    exports.push((key.clone(), host.clone()));
                }
            }
        }
    }

    // add vertices: the surviving normal plus every hidden variant
    let mut graph: Graph<BoxedRes, Edge> = Graph::new("interpret");
    let mut normal_ix: HashMap<ResKey, NodeIndex> = HashMap::new();
    let mut group_ix: HashMap<ResKey, Vec<NodeIndex>> = HashMap::new();
    for key in &order {
        if let Some(slot) = slots.remove(key) {
            let mut group = Vec::new();
            if let Some(res) = slot.normal {
                let ix = graph.add_vertex(res);
                normal_ix.insert(key.clone(), ix);
                group.push(ix);
            }
            for hidden in slot.hidden {
                group.push(graph.add_vertex(hidden));
            }
            group_ix.insert(key.clone(), group);
        }
    }

    // edges: cartesian product over the per-key vertex groups, with
    // notify OR-merged onto existing edges
    for spec in &edges {
        let key1 = spec.key1();
        let key2 = spec.key2();
        let group1 = group_ix
            .get(&key1)
            .filter(|g| !g.is_empty())
            .ok_or_else(|| EngineError::Graph(GraphError::MissingVertex(key1.to_string())))?;
        let group2 = group_ix
            .get(&key2)
            .filter(|g| !g.is_empty())
            .ok_or_else(|| EngineError::Graph(GraphError::MissingVertex(key2.to_string())))?;
        for &v1 in group1 {
            for &v2 in group2 {
                match graph.find_edge(v1, v2) {
                    Some(eix) => {
                        if let Some(edge) = graph.edge_mut(eix) {
                            edge.notify = edge.notify || spec.notify;
                        }
                    }
                    None => {
                        graph.add_edge(v1, v2, Edge::new(format!("{} -> {}", key1, key2), spec.notify));
                    }
                }
            }
        }
    }

    // send/recv wiring
    let mut recvs: HashMap<ResKey, RecvMap> = HashMap::new();
    for spec in &edges {
        let (send_field, recv_field) = match (&spec.send, &spec.recv) {
            (None, None) => continue,
            (Some(s), Some(r)) => (s, r),
            _ => {
                return Err(EngineError::SendRecv(format!(
                    "edge {} -> {} must carry both send and recv or neither",
                    spec.key1(),
                    spec.key2()
                )))
            }
        };
        let key1 = spec.key1();
        let key2 = spec.key2();

        let sender_ix = normal_ix.get(&key1).copied().ok_or_else(|| {
            EngineError::SendRecv(format!("cannot send from hidden resource {}", key1))
        })?;
        let recv_ix = normal_ix.get(&key2).copied().ok_or_else(|| {
            EngineError::SendRecv(format!("cannot recv on hidden resource {}", key2))
        })?;

        let sender = graph
            .vertex(sender_ix)
            .ok_or_else(|| EngineError::Internal("sender vertex vanished".to_string()))?;
        let receiver = graph
            .vertex(recv_ix)
            .ok_or_else(|| EngineError::Internal("recv vertex vanished".to_string()))?;

        let send_schema = sender
            .as_sendable()
            .ok_or_else(|| EngineError::SendRecv(format!("{} is not sendable", key1)))?
            .send_fields();
        let recv_schema = receiver
            .as_recvable()
            .ok_or_else(|| EngineError::SendRecv(format!("{} is not recvable", key2)))?
            .recv_fields();

        let send_type = send_schema.get(send_field).ok_or_else(|| {
            EngineError::SendRecv(format!("{} has no send field {}", key1, send_field))
        })?;
        let recv_type = recv_schema.get(recv_field).ok_or_else(|| {
            EngineError::SendRecv(format!("{} has no recv field {}", key2, recv_field))
        })?;
        struct_fields_compatible(send_type, recv_type).map_err(|e| {
            EngineError::SendRecv(format!(
                "{}.{} -> {}.{}: {}",
                key1, send_field, key2, recv_field, e
            ))
        })?;

        let wire = RecvWire {
            sender: key1.clone(),
            sender_field: send_field.clone(),
        };
        let map = recvs.entry(key2.clone()).or_default();
        match map.get(recv_field) {
            None => {
                map.insert(recv_field.clone(), wire);
            }
            Some(existing) if *existing == wire => {}
            Some(existing) => {
                return Err(EngineError::SendRecv(format!(
                    "recv field {}.{} already wired to {}",
                    key2, recv_field, existing.sender
                )))
            }
        }
    }

    // acyclicity; the error payload names the offending cycle
    graph.topo_sort()?;

    debug!(
        vertices = graph.num_vertices(),
        edges = graph.num_edges(),
        "graph assembly complete"
    );
    Ok(Assembly {
        graph,
        recvs,
        exports,
    })
}
