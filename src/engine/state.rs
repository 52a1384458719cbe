//! Per-vertex worker state
//!
//! Everything a worker coordinates through lives here: the cancellation
//! scope, the event/poke channels, the pause rendezvous, retry
//! accounting, the refresh bit, and the send/recv caches. The scheduler
//! reads this state only between pause/resume handshakes; the worker owns
//! it the rest of the time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{EngineError, EngineResult};
use crate::resource::{HandleOps, MetaParams, RecvValue, ResKey, Resource};

use super::converger::ConvergerUid;
use super::ratelimit::EventLimiter;
use super::token::CancelToken;
use super::Shared;

/// Which private done signal ended the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DoneReason {
    /// Process loop exhausted its retry budget
    Process,
    /// Watch exhausted its retry budget
    Watch,
    /// Rate-limit reservation lost to cancellation
    Limit,
    /// The vertex was removed by a graph swap
    Remove,
    /// Engine shutdown
    Shutdown,
}

/// Observable worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Uninit,
    Init,
    Watching,
    Processing,
    Paused,
    Retrying,
    Failed,
    Cleanup,
    Done,
}

/// Pause request carrying the acknowledgement channel.
pub(crate) struct PauseReq {
    pub ack: oneshot::Sender<()>,
}

/// One received field with its change marker, engine side.
#[derive(Debug, Clone)]
pub(crate) struct RecvState {
    pub sender: ResKey,
    pub sender_field: String,
    pub value: Value,
    pub changed: bool,
}

/// One outgoing send route, engine side.
#[derive(Debug, Clone)]
pub(crate) struct SendTarget {
    pub recv_key: ResKey,
    pub recv_field: String,
    pub sender_field: String,
}

/// The full coordination surface of one vertex.
pub(crate) struct State {
    pub key: ResKey,
    pub res: Arc<dyn Resource>,
    pub meta: Mutex<MetaParams>,

    /// Cancellation scope for this worker; closing any done signal
    /// cancels it.
    pub token: CancelToken,
    done_reason: Mutex<Option<DoneReason>>,
    pub status: Mutex<WorkerStatus>,

    // watch -> process events; capacity one, sender blocks when a second
    // event is already pending
    pub events_tx: mpsc::Sender<()>,
    pub events_rx: Mutex<Option<mpsc::Receiver<()>>>,

    // poke channel; capacity one, non-blocking senders coalesce
    pub poke_tx: mpsc::Sender<()>,
    pub poke_rx: Mutex<Option<mpsc::Receiver<()>>>,

    // pause/resume rendezvous
    pub pause_tx: mpsc::Sender<PauseReq>,
    pub pause_rx: Mutex<Option<mpsc::Receiver<PauseReq>>>,
    pub resume_tx: mpsc::Sender<()>,
    pub resume_rx: Mutex<Option<mpsc::Receiver<()>>>,
    pub paused: AtomicBool,

    // retry accounting, shared by watch and process
    pub retry_left: Mutex<i64>,
    pub last_watch_error: Mutex<Option<String>>,

    // refresh and send/recv
    pub refresh: AtomicBool,
    pub send_cache: Mutex<Option<Value>>,
    pub last_pushed: Mutex<Option<Value>>,
    pub recvs: Mutex<HashMap<String, RecvState>>,
    pub send_targets: Mutex<Vec<SendTarget>>,

    // lifecycle bookkeeping
    pub started: AtomicBool,
    pub ever_converged: AtomicBool,
    pub limiter: EventLimiter,
    pub tuid: ConvergerUid,
    pub cuid: ConvergerUid,
    pub var_dir_base: PathBuf,
    pub worker: Mutex<Option<JoinHandle<()>>>,
    pub debug: bool,
}

impl State {
    pub fn new(
        res: Arc<dyn Resource>,
        shared: &Shared,
    ) -> EngineResult<Arc<State>> {
        let key = ResKey::of(res.as_ref());
        let meta = res.meta().clone();
        let limiter = EventLimiter::from_meta(&meta)?;
        let (events_tx, events_rx) = mpsc::channel(1);
        let (poke_tx, poke_rx) = mpsc::channel(1);
        let (pause_tx, pause_rx) = mpsc::channel(1);
        let (resume_tx, resume_rx) = mpsc::channel(1);
        let var_dir_base = shared.config.var_dir(&key.kind, &key.name);
        let tuid = shared.converger.register(format!("{}:timer", key));
        let cuid = shared.converger.register(format!("{}:status", key));
        if meta.hidden {
            // placeholders never run a worker, so their tokens must not
            // hold back the convergence report
            tuid.set_converged(true);
            cuid.set_converged(true);
        }
        Ok(Arc::new(State {
            retry_left: Mutex::new(meta.retry),
            key,
            res,
            meta: Mutex::new(meta),
            token: shared.token.child(),
            done_reason: Mutex::new(None),
            status: Mutex::new(WorkerStatus::Uninit),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            poke_tx,
            poke_rx: Mutex::new(Some(poke_rx)),
            pause_tx,
            pause_rx: Mutex::new(Some(pause_rx)),
            resume_tx,
            resume_rx: Mutex::new(Some(resume_rx)),
            paused: AtomicBool::new(false),
            last_watch_error: Mutex::new(None),
            refresh: AtomicBool::new(false),
            send_cache: Mutex::new(None),
            last_pushed: Mutex::new(None),
            recvs: Mutex::new(HashMap::new()),
            send_targets: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            ever_converged: AtomicBool::new(false),
            limiter,
            tuid,
            cuid,
            var_dir_base,
            worker: Mutex::new(None),
            debug: shared.config.debug,
        }))
    }

    pub fn hidden(&self) -> bool {
        self.meta.lock().hidden
    }

    pub fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status;
        trace!(vertex = %self.key, ?status, "worker status");
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    /// Close one of the private done signals, cancelling the worker scope.
    pub fn close(&self, reason: DoneReason) {
        let mut slot = self.done_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.token.cancel();
    }

    pub fn done_reason(&self) -> Option<DoneReason> {
        *self.done_reason.lock()
    }

    /// Consume one retry. True when the worker may try again.
    pub fn consume_retry(&self) -> bool {
        let mut left = self.retry_left.lock();
        if *left == -1 {
            return true;
        }
        if *left > 0 {
            *left -= 1;
            return true;
        }
        false
    }

    /// Restore the retry budget from the current meta-params.
    pub fn restore_retry(&self) {
        *self.retry_left.lock() = self.meta.lock().retry;
    }

    /// Reset runtime counters and caches, for `meta.reset` replacements.
    pub fn reset_counters(&self) {
        self.restore_retry();
        *self.send_cache.lock() = None;
        *self.last_pushed.lock() = None;
        *self.last_watch_error.lock() = None;
        for recv in self.recvs.lock().values_mut() {
            recv.changed = false;
        }
        self.ever_converged.store(false, Ordering::SeqCst);
    }

    /// Non-blocking poke; a pending poke absorbs this one.
    pub fn poke(&self) {
        let _ = self.poke_tx.try_send(());
    }
}

/// The engine side of a resource handle: thin adapter from [`HandleOps`]
/// onto the vertex state and the shared engine.
pub(crate) struct StateHandle {
    pub state: Arc<State>,
    pub shared: Weak<Shared>,
}

#[async_trait]
impl HandleOps for StateHandle {
    fn running(&self) {
        if !self.state.started.swap(true, Ordering::SeqCst) {
            trace!(vertex = %self.state.key, "watch running");
        }
    }

    async fn event(&self) {
        // worker gone means shutdown; nothing to signal
        let _ = self.state.events_tx.send(()).await;
    }

    fn refresh(&self) -> bool {
        self.state.refresh.load(Ordering::SeqCst)
    }

    fn send(&self, value: Value) -> EngineResult<()> {
        if self.state.res.as_sendable().is_none() {
            return Err(EngineError::SendRecv(format!(
                "{} is not sendable",
                self.state.key
            )));
        }
        if self.state.hidden() {
            return Err(EngineError::SendRecv(format!(
                "hidden resource {} may not send",
                self.state.key
            )));
        }
        *self.state.send_cache.lock() = Some(value);
        Ok(())
    }

    fn recv(&self) -> HashMap<String, RecvValue> {
        let mut recvs = self.state.recvs.lock();
        recvs
            .iter_mut()
            .map(|(field, recv)| {
                let snapshot = RecvValue {
                    value: recv.value.clone(),
                    changed: recv.changed,
                };
                // change flags are delivered exactly once
                recv.changed = false;
                (field.clone(), snapshot)
            })
            .collect()
    }

    fn filtered_graph(&self) -> Vec<ResKey> {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return Vec::new(),
        };
        let run = shared.graph.read();
        run.graph
            .vertices()
            .filter(|(_, v)| v.state.key != self.state.key)
            .filter(|(_, v)| {
                v.state
                    .res
                    .as_graph_queryable()
                    .map(|q| q.query_allowed(&self.state.key).is_ok())
                    .unwrap_or(false)
            })
            .map(|(_, v)| v.state.key.clone())
            .collect()
    }

    fn var_dir(&self, sub: &str) -> EngineResult<PathBuf> {
        let dir = self.state.var_dir_base.join(sub);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
