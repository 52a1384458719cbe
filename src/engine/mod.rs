//! The convergence engine
//!
//! Attaches a worker to every vertex of an assembled graph and keeps the
//! host converged toward it. Subsequent commits diff the new graph
//! against the running one and swap it in online, preserving matching
//! workers.

mod converger;
mod ratelimit;
mod semaphore;
mod state;
mod swap;
mod token;
mod worker;

pub use converger::{Converger, ConvergerUid};
pub use ratelimit::EventLimiter;
pub use semaphore::SemaPool;
pub use state::WorkerStatus;
pub use token::CancelToken;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::error::EngineResult;
use crate::graph::{Graph, NodeIndex};
use crate::interpret::Assembly;
use crate::resource::{Edge, ResKey};
use crate::world::World;

use state::State;

/// One vertex of the running graph.
pub(crate) struct RunVertex {
    pub state: Arc<State>,
}

impl fmt::Display for RunVertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state.key)
    }
}

/// The running graph plus lookup helpers.
pub(crate) struct RunGraph {
    pub graph: Graph<RunVertex, Edge>,
}

impl RunGraph {
    fn empty() -> Self {
        Self {
            graph: Graph::new("run"),
        }
    }

    /// Index of the non-hidden vertex with this key.
    pub fn index_of(&self, key: &ResKey) -> Option<NodeIndex> {
        self.graph
            .vertices()
            .find(|(_, v)| !v.state.hidden() && v.state.key == *key)
            .map(|(ix, _)| ix)
    }

    /// State of the non-hidden vertex with this key.
    pub fn find_state(&self, key: &ResKey) -> Option<Arc<State>> {
        self.index_of(key)
            .and_then(|ix| self.graph.vertex(ix))
            .map(|v| v.state.clone())
    }
}

/// Shared engine internals, reachable from workers and handles.
pub(crate) struct Shared {
    pub config: Config,
    pub world: Arc<dyn World>,
    pub semas: SemaPool,
    pub converger: Arc<Converger>,
    pub token: CancelToken,
    pub graph: RwLock<RunGraph>,
    pub degraded: AtomicBool,
}

/// The engine itself.
pub struct Engine {
    shared: Arc<Shared>,
    converger_task: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: Config, world: Arc<dyn World>) -> EngineResult<Self> {
        config.validate()?;
        let token = CancelToken::new();
        let converger = Arc::new(Converger::new(config.converged_timeout));
        let converger_task = converger.clone().run(token.child());
        let shared = Arc::new(Shared {
            config,
            world,
            semas: SemaPool::new(),
            converger,
            token,
            graph: RwLock::new(RunGraph::empty()),
            degraded: AtomicBool::new(false),
        });
        Ok(Self {
            shared,
            converger_task: Some(converger_task),
        })
    }

    /// Commit an assembled graph: the first call starts everything, later
    /// calls perform an online graph swap.
    pub async fn commit(&self, assembly: Assembly) -> EngineResult<()> {
        swap::commit(&self.shared, assembly).await
    }

    /// Subscribe to convergence transitions (requires a configured
    /// converged-timeout).
    pub fn converged(&self) -> watch::Receiver<bool> {
        self.shared.converger.subscribe()
    }

    /// Whether any vertex has failed permanently.
    pub fn degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::SeqCst)
    }

    /// Current worker status for a vertex, if present.
    pub fn vertex_status(&self, key: &ResKey) -> Option<WorkerStatus> {
        self.shared.graph.read().find_state(key).map(|s| s.status())
    }

    /// Request a re-run of check-apply on one vertex. Pokes coalesce.
    pub fn poke(&self, key: &ResKey) -> bool {
        match self.shared.graph.read().find_state(key) {
            Some(state) => {
                state.poke();
                true
            }
            None => false,
        }
    }

    /// Pause one worker; the call returns once the worker acknowledged at
    /// a safe point. Must not be called while paused.
    pub async fn pause(&self, key: &ResKey) -> EngineResult<()> {
        let state = self.shared.graph.read().find_state(key);
        match state {
            Some(state) => swap::pause_vertex(&state).await,
            None => Ok(()),
        }
    }

    /// Resume one worker; a no-op when it is already running.
    pub async fn resume(&self, key: &ResKey) -> EngineResult<()> {
        let state = self.shared.graph.read().find_state(key);
        match state {
            Some(state) => swap::resume_vertex(&state).await,
            None => Ok(()),
        }
    }

    /// Graphviz dump of the running graph.
    pub fn graph_dot(&self) -> String {
        self.shared.graph.read().graph.to_dot()
    }

    /// Number of vertices currently running.
    pub fn num_vertices(&self) -> usize {
        self.shared.graph.read().graph.num_vertices()
    }

    /// Cancel every worker and join them all.
    pub async fn shutdown(mut self) -> EngineResult<()> {
        debug!("engine shutdown");
        let handles: Vec<JoinHandle<()>> = {
            let run = self.shared.graph.read();
            run.graph
                .vertices()
                .map(|(_, v)| {
                    v.state.close(state::DoneReason::Shutdown);
                    if let Some(interruptable) = v.state.res.as_interruptable() {
                        interruptable.interrupt();
                    }
                    v.state.worker.lock().take()
                })
                .flatten()
                .collect()
        };
        self.shared.token.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(task) = self.converger_task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}
