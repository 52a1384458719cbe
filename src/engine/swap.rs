//! Online graph swap
//!
//! Replaces the executable graph with a newly assembled one while
//! preserving as much per-worker state as possible. The swap is
//! all-or-nothing from the caller's perspective: new resources are
//! validated and inited before anything existing is touched, so an init
//! failure leaves the running graph in effect.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::graph::{Graph, NodeIndex};
use crate::interpret::Assembly;
use crate::resource::{res_cmp, Edge, HandleOps, ResHandle, ResKey, Resource};
use crate::world::WireRes;

use super::state::{DoneReason, PauseReq, RecvState, SendTarget, State, StateHandle};
use super::worker::spawn_worker;
use super::{RunVertex, Shared};

/// How one new vertex maps onto the running graph.
enum Placement {
    /// Fresh vertex: init and start a worker.
    Add,
    /// Same resource, unchanged: reuse the old state and worker.
    Keep(Arc<State>),
    /// Same key, changed parameters: copy them over in place.
    KeepChanged(Arc<State>),
}

/// Commit a newly assembled graph, swapping it in online.
pub(crate) async fn commit(shared: &Arc<Shared>, assembly: Assembly) -> EngineResult<()> {
    let Assembly {
        graph: mut new_graph,
        recvs,
        exports,
    } = assembly;

    // exports go to the cluster store first; the store is idempotent so
    // an aborted swap leaves nothing inconsistent
    publish_exports(shared, &new_graph, exports.len()).await?;

    // dismantle the assembly into shared resources plus an edge list
    let new_edges: Vec<(NodeIndex, NodeIndex, Edge)> = new_graph
        .edges()
        .map(|(a, b, e)| (a, b, e.clone()))
        .collect();
    let mut new_vertices: Vec<(NodeIndex, Arc<dyn Resource>)> = Vec::new();
    for ix in new_graph.vertex_indices() {
        let res = new_graph.remove_vertex(ix).ok_or_else(|| {
            EngineError::Internal("assembly vertex vanished during commit".to_string())
        })?;
        new_vertices.push((ix, Arc::from(res)));
    }

    // snapshot the running graph
    let (old_normal, old_topo) = {
        let run = shared.graph.read();
        let mut normal: HashMap<ResKey, Arc<State>> = HashMap::new();
        for (_, vertex) in run.graph.vertices() {
            if !vertex.state.hidden() {
                normal.insert(vertex.state.key.clone(), vertex.state.clone());
            }
        }
        let topo: Vec<Arc<State>> = run
            .graph
            .topo_sort()?
            .into_iter()
            .filter_map(|ix| run.graph.vertex(ix).map(|v| v.state.clone()))
            .collect();
        (normal, topo)
    };

    // classify each new vertex against the running graph
    let default_rewatch = shared.config.default_rewatch;
    let mut placements: HashMap<NodeIndex, Placement> = HashMap::new();
    let mut kept_keys: HashSet<ResKey> = HashSet::new();
    for (ix, res) in &new_vertices {
        if res.meta().hidden {
            // hidden vertices carry no worker state; rebuild them fresh
            placements.insert(*ix, Placement::Add);
            continue;
        }
        let key = ResKey::of(res.as_ref());
        let placement = match old_normal.get(&key) {
            None => Placement::Add,
            Some(old_state) => {
                let force_recreate = res.meta().rewatch_or(default_rewatch)
                    && old_state.last_watch_error.lock().is_some();
                if force_recreate {
                    debug!(vertex = %key, "rewatch forces recreate");
                    Placement::Add
                } else if res_cmp(old_state.res.as_ref(), res.as_ref()).is_ok() {
                    Placement::Keep(old_state.clone())
                } else if mergeable(old_state.res.as_ref(), res.as_ref()) {
                    Placement::KeepChanged(old_state.clone())
                } else {
                    Placement::Add
                }
            }
        };
        if matches!(placement, Placement::Keep(_) | Placement::KeepChanged(_)) {
            kept_keys.insert(key);
        }
        placements.insert(*ix, placement);
    }

    // build fresh states for the adds and init them; any failure aborts
    // the swap with the old graph untouched
    let mut added: HashMap<NodeIndex, Arc<State>> = HashMap::new();
    for (ix, res) in &new_vertices {
        if !matches!(placements.get(ix), Some(Placement::Add)) {
            continue;
        }
        let state = State::new(res.clone(), shared)?;
        if !state.hidden() {
            let handle = ResHandle::new(
                Arc::new(StateHandle {
                    state: state.clone(),
                    shared: Arc::downgrade(shared),
                }) as Arc<dyn HandleOps>,
                shared.world.clone(),
                state.key.clone(),
                shared.config.debug,
            );
            res.init(handle)
                .await
                .map_err(|e| EngineError::Init(format!("{}: {}", state.key, e)))?;
        }
        added.insert(*ix, state);
    }

    // pause the running graph in topological order, roots first
    for state in &old_topo {
        if state.hidden() {
            continue;
        }
        pause_vertex(state).await?;
    }

    // removals: everything not kept
    let removals: Vec<Arc<State>> = old_topo
        .iter()
        .rev() // leaves first
        .filter(|s| s.hidden() || !kept_keys.contains(&s.key))
        .cloned()
        .collect();
    for state in &removals {
        remove_vertex(shared, state).await;
    }

    // kept vertices adopt the new graph's meta-params; changed parameters
    // are copied over the old resource in place, preserving worker state
    for (ix, res) in &new_vertices {
        match placements.get(ix) {
            Some(Placement::Keep(old_state)) => {
                *old_state.meta.lock() = res.meta().clone();
            }
            Some(Placement::KeepChanged(old_state)) => {
                if let Some(copyable) = old_state.res.as_copyable() {
                    copyable.copy_params_from(res.as_ref())?;
                } else {
                    warn!(
                        vertex = %old_state.key,
                        "changed but not copyable; keeping old parameters"
                    );
                }
                *old_state.meta.lock() = res.meta().clone();
                if res.meta().reset {
                    old_state.reset_counters();
                }
            }
            _ => {}
        }
    }

    // pending refresh on edges between kept vertices survives the rebuild
    let old_refresh: HashMap<(ResKey, ResKey), bool> = {
        let run = shared.graph.read();
        run.graph
            .edges()
            .filter(|(_, _, e)| e.notify)
            .filter_map(|(a, b, e)| {
                let ka = run.graph.vertex(a)?.state.key.clone();
                let kb = run.graph.vertex(b)?.state.key.clone();
                Some(((ka, kb), e.refresh()))
            })
            .collect()
    };

    // assemble the new running graph, reusing kept states
    let mut run_graph: Graph<RunVertex, Edge> = Graph::new("run");
    let mut ix_map: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut to_start: Vec<Arc<State>> = Vec::new();
    for (ix, _res) in &new_vertices {
        let state = match placements.remove(ix) {
            Some(Placement::Keep(state)) | Some(Placement::KeepChanged(state)) => state,
            Some(Placement::Add) => {
                let state = added.remove(ix).ok_or_else(|| {
                    EngineError::Internal("placement lost its state".to_string())
                })?;
                if !state.hidden() {
                    to_start.push(state.clone());
                }
                state
            }
            None => {
                return Err(EngineError::Internal(
                    "unclassified vertex in commit".to_string(),
                ))
            }
        };
        let run_ix = run_graph.add_vertex(RunVertex { state });
        ix_map.insert(*ix, run_ix);
    }
    for (a, b, edge) in new_edges {
        let (Some(&ra), Some(&rb)) = (ix_map.get(&a), ix_map.get(&b)) else {
            continue;
        };
        if edge.notify {
            let ka = run_graph.vertex(ra).map(|v| v.state.key.clone());
            let kb = run_graph.vertex(rb).map(|v| v.state.key.clone());
            if let (Some(ka), Some(kb)) = (ka, kb) {
                if old_refresh.get(&(ka, kb)).copied().unwrap_or(false) {
                    edge.set_refresh(true);
                }
            }
        }
        run_graph.add_edge(ra, rb, edge);
    }

    // wire send/recv onto the states
    wire_sendrecv(&run_graph, &recvs);

    // swap the graph in
    {
        let mut run = shared.graph.write();
        run.graph = run_graph;
    }

    // start the new workers, then resume everything paused
    for state in &to_start {
        spawn_worker(shared, state);
    }
    {
        let run = shared.graph.read();
        let resumable: Vec<Arc<State>> = run
            .graph
            .vertices()
            .map(|(_, v)| v.state.clone())
            .collect();
        drop(run);
        for state in resumable {
            resume_vertex(&state).await?;
        }
    }

    info!(
        added = to_start.len(),
        kept = kept_keys.len(),
        "graph swap committed"
    );
    Ok(())
}

/// Whether an old/new pair may be merged in place rather than replaced.
fn mergeable(old: &dyn Resource, new: &dyn Resource) -> bool {
    if new.meta().reset {
        return false;
    }
    match (old.as_compatible(), new.as_compatible()) {
        (Some(compat), Some(_)) => compat.adapts(new).is_ok(),
        _ => false,
    }
}

async fn publish_exports(
    shared: &Arc<Shared>,
    new_graph: &Graph<Box<dyn Resource>, Edge>,
    count: usize,
) -> EngineResult<()> {
    if count == 0 {
        return Ok(());
    }
    for (_, res) in new_graph.vertices() {
        for host in &res.meta().export {
            let data = match res.as_exportable() {
                Some(exportable) => exportable.to_wire()?,
                None => String::new(),
            };
            shared
                .world
                .export_resource(WireRes {
                    kind: res.kind().to_string(),
                    name: res.name().to_string(),
                    host: host.clone(),
                    data,
                })
                .await?;
        }
    }
    Ok(())
}

/// Remove one vertex: honor reversal and realize, then cancel and join
/// its worker. The worker's own teardown runs the resource cleanup.
async fn remove_vertex(shared: &Arc<Shared>, state: &Arc<State>) {
    if let Some(reversible) = state.res.as_reversible() {
        if reversible.reversible_meta().enabled {
            match reversible.reversed() {
                Ok(reverse) => {
                    let wire = WireRes {
                        kind: reverse.kind().to_string(),
                        name: reverse.name().to_string(),
                        host: shared.config.hostname.clone(),
                        data: String::new(),
                    };
                    if let Err(err) = shared.world.export_resource(wire).await {
                        warn!(vertex = %state.key, %err, "failed to commit reversal");
                    }
                }
                Err(err) => warn!(vertex = %state.key, %err, "reversal construction failed"),
            }
        }
    }

    if state.meta.lock().realize && !state.ever_converged.load(Ordering::SeqCst) {
        // give the vertex a bounded chance at its first converge
        let wait = Duration::from_millis(shared.config.realize_wait_ms);
        let _ = resume_vertex(state).await;
        state.poke();
        let deadline = tokio::time::Instant::now() + wait;
        while !state.ever_converged.load(Ordering::SeqCst)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !state.ever_converged.load(Ordering::SeqCst) {
            warn!(vertex = %state.key, "removing realize vertex before first converge");
        }
        let _ = pause_vertex(state).await;
    }

    state.close(DoneReason::Remove);
    // a hard kick for resources that support it; the rest may run their
    // current check-apply to completion
    if let Some(interruptable) = state.res.as_interruptable() {
        interruptable.interrupt();
    }
    let handle = state.worker.lock().take();
    if let Some(handle) = handle {
        let _ = handle.await;
    }
    debug!(vertex = %state.key, "vertex removed");
}

/// Rebuild every state's recv map and send routes from the assembly's
/// wiring tables, preserving in-flight values where the wiring is
/// unchanged.
fn wire_sendrecv(
    run_graph: &Graph<RunVertex, Edge>,
    recvs: &HashMap<ResKey, crate::resource::RecvMap>,
) {
    let find = |key: &ResKey| -> Option<Arc<State>> {
        run_graph
            .vertices()
            .find(|(_, v)| !v.state.hidden() && v.state.key == *key)
            .map(|(_, v)| v.state.clone())
    };

    // reset send routes everywhere; they are rebuilt below
    for (_, vertex) in run_graph.vertices() {
        vertex.state.send_targets.lock().clear();
    }

    for (_, vertex) in run_graph.vertices() {
        let state = &vertex.state;
        let wanted = recvs.get(&state.key);
        let mut map = state.recvs.lock();
        match wanted {
            None => map.clear(),
            Some(wires) => {
                map.retain(|field, entry| {
                    wires.get(field).is_some_and(|w| {
                        w.sender == entry.sender && w.sender_field == entry.sender_field
                    })
                });
                for (field, wire) in wires {
                    map.entry(field.clone()).or_insert_with(|| RecvState {
                        sender: wire.sender.clone(),
                        sender_field: wire.sender_field.clone(),
                        value: serde_json::Value::Null,
                        changed: false,
                    });
                    if let Some(sender) = find(&wire.sender) {
                        sender.send_targets.lock().push(SendTarget {
                            recv_key: state.key.clone(),
                            recv_field: field.clone(),
                            sender_field: wire.sender_field.clone(),
                        });
                    }
                }
            }
        }
    }
}

/// Pause one worker. Must not be called while already paused; the
/// handshake returns once the worker acknowledged at a safe point.
pub(crate) async fn pause_vertex(state: &Arc<State>) -> EngineResult<()> {
    if state.paused.swap(true, Ordering::SeqCst) {
        return Err(EngineError::Pause(format!(
            "{} is already paused",
            state.key
        )));
    }
    let (ack_tx, ack_rx) = oneshot::channel();
    if state.pause_tx.send(PauseReq { ack: ack_tx }).await.is_err() {
        // worker already exited; nothing to rendezvous with
        return Ok(());
    }
    let _ = ack_rx.await;
    Ok(())
}

/// Resume one worker. A no-op on a worker that is already running.
pub(crate) async fn resume_vertex(state: &Arc<State>) -> EngineResult<()> {
    if !state.paused.swap(false, Ordering::SeqCst) {
        return Ok(());
    }
    let _ = state.resume_tx.send(()).await;
    Ok(())
}
