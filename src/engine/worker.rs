//! Per-vertex worker: a watch task and a process loop
//!
//! The watch side observes the world and signals "state may have changed";
//! the process side converges. They share one cancellation scope and talk
//! over a capacity-one event channel. Pokes from neighbours and the engine
//! land on a separate coalescing channel. The process loop only yields to
//! a pause at safe points between check-apply cycles.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info, trace, warn};

use crate::error::{EngineError, EngineResult};
use crate::resource::{field_of, CheckResult};

use super::semaphore::SemaPool;
use super::state::{DoneReason, State, WorkerStatus};
use super::Shared;

/// Spawn the worker task for one vertex and record its join handle.
pub(crate) fn spawn_worker(shared: &Arc<Shared>, state: &Arc<State>) {
    let handle = tokio::spawn(run_worker(shared.clone(), state.clone()));
    *state.worker.lock() = Some(handle);
}

async fn run_worker(shared: Arc<Shared>, state: Arc<State>) {
    state.set_status(WorkerStatus::Init);
    let watch_handle = tokio::spawn(run_watch(shared.clone(), state.clone()));

    // every fresh worker converges once regardless of watch activity
    state.poke();
    run_process(&shared, &state).await;

    // the process loop only exits with the scope cancelled, which watch
    // observes; join it before teardown
    state.token.cancel();
    let _ = watch_handle.await;

    state.set_status(WorkerStatus::Cleanup);
    if let Err(err) = state.res.cleanup().await {
        warn!(vertex = %state.key, %err, "cleanup failed");
    }
    state.set_status(WorkerStatus::Done);
    debug!(vertex = %state.key, reason = ?state.done_reason(), "worker done");
}

/// Watch driver: native resource watch, or a ticker when `meta.poll` is
/// set. Errors consume the shared retry budget.
async fn run_watch(shared: Arc<Shared>, state: Arc<State>) {
    let poll = state.meta.lock().poll;
    loop {
        if state.token.is_cancelled() {
            break;
        }
        let result = if poll > 0 {
            poll_watch(&state, poll).await
        } else {
            match AssertUnwindSafe(state.res.watch(&state.token))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(EngineError::Watch(format!(
                    "panic in watch: {}",
                    panic_message(&payload)
                ))),
            }
        };
        match result {
            Ok(()) => break,
            Err(err) if err.is_cancelled() || state.token.is_cancelled() => break,
            Err(err) => {
                warn!(vertex = %state.key, %err, "watch error");
                *state.last_watch_error.lock() = Some(err.to_string());
                if state.consume_retry() {
                    let delay = state.meta.lock().delay;
                    if delay > 0 && !sleep_or_cancel(&state, delay).await {
                        break;
                    }
                    continue;
                }
                error!(vertex = %state.key, "watch retry budget exhausted");
                shared.degraded.store(true, Ordering::SeqCst);
                state.set_status(WorkerStatus::Failed);
                state.close(DoneReason::Watch);
                break;
            }
        }
    }
}

/// Fixed-interval poll substitute for a native watch.
async fn poll_watch(state: &Arc<State>, poll: u32) -> EngineResult<()> {
    // the engine subscribes on the resource's behalf
    state.started.store(true, Ordering::SeqCst);
    let mut interval = tokio::time::interval(Duration::from_secs(u64::from(poll)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // the leading immediate tick
    loop {
        tokio::select! {
            _ = state.token.cancelled() => return Ok(()),
            _ = interval.tick() => {}
        }
        tokio::select! {
            _ = state.token.cancelled() => return Ok(()),
            _ = state.events_tx.send(()) => {}
        }
    }
}

async fn run_process(shared: &Arc<Shared>, state: &Arc<State>) {
    let rx = (
        state.events_rx.lock().take(),
        state.poke_rx.lock().take(),
        state.pause_rx.lock().take(),
        state.resume_rx.lock().take(),
    );
    let (Some(mut events_rx), Some(mut poke_rx), Some(mut pause_rx), Some(mut resume_rx)) = rx
    else {
        error!(vertex = %state.key, "worker channels already taken");
        state.close(DoneReason::Process);
        return;
    };

    loop {
        state.set_status(WorkerStatus::Watching);
        state.tuid.start_timer();
        tokio::select! {
            biased;
            _ = state.token.cancelled() => break,
            Some(req) = pause_rx.recv() => {
                state.set_status(WorkerStatus::Paused);
                let _ = req.ack.send(());
                tokio::select! {
                    _ = state.token.cancelled() => break,
                    Some(()) = resume_rx.recv() => continue,
                }
            }
            Some(()) = events_rx.recv() => {
                trace!(vertex = %state.key, "event");
            }
            Some(()) = poke_rx.recv() => {
                trace!(vertex = %state.key, "poke");
            }
        }
        state.tuid.stop_timer();
        state.cuid.set_converged(false);
        state.set_status(WorkerStatus::Processing);

        // token-bucket throttle; losing the reservation to cancellation
        // closes the limit signal
        if state.limiter.throttle(&state.token).await.is_err() {
            state.close(DoneReason::Limit);
            break;
        }

        // refresh from incoming notify edges becomes visible before the
        // check-apply it triggers
        let refresh = gather_refresh(shared, state);
        state.refresh.store(refresh, Ordering::SeqCst);
        if let Some(refreshable) = state.res.as_refreshable() {
            refreshable.set_refresh(refresh);
        }

        let sema_ids = state.meta.lock().sema.clone();
        let permits = match shared.semas.acquire(&sema_ids, &state.token).await {
            Ok(permits) => permits,
            Err(_) => break,
        };

        let apply = !state.meta.lock().noop;
        let outcome = AssertUnwindSafe(state.res.check_apply(apply))
            .catch_unwind()
            .await;
        let result: EngineResult<CheckResult> = match outcome {
            Ok(result) => result,
            Err(payload) => Err(EngineError::Apply(format!(
                "panic in check_apply: {}",
                panic_message(&payload)
            ))),
        };
        SemaPool::release(permits);

        // the refresh bit is observed by exactly one invocation
        state.refresh.store(false, Ordering::SeqCst);
        if let Some(refreshable) = state.res.as_refreshable() {
            refreshable.set_refresh(false);
        }

        match result {
            Err(err) if err.is_cancelled() => break,
            Err(err) => {
                warn!(vertex = %state.key, %err, "check-apply error");
                if state.consume_retry() {
                    state.set_status(WorkerStatus::Retrying);
                    let delay = state.meta.lock().delay;
                    if delay > 0 && !sleep_or_cancel(state, delay).await {
                        break;
                    }
                    state.poke();
                    continue;
                }
                error!(vertex = %state.key, "check-apply retry budget exhausted");
                state.set_status(WorkerStatus::Failed);
                shared.degraded.store(true, Ordering::SeqCst);
                state.close(DoneReason::Process);
                break;
            }
            Ok(check) => {
                if check.check_ok {
                    state.ever_converged.store(true, Ordering::SeqCst);
                    state.cuid.set_converged(true);
                    if check.changed {
                        if state.meta.lock().retry_reset {
                            state.restore_retry();
                        }
                        info!(vertex = %state.key, "converged with change");
                        propagate(shared, state);
                    }
                } else {
                    trace!(vertex = %state.key, "work pending, apply disabled");
                }
            }
        }
    }
}

/// Collect and clear pending refresh bits on incoming notify edges.
fn gather_refresh(shared: &Arc<Shared>, state: &Arc<State>) -> bool {
    let run = shared.graph.read();
    let my_ix = match run.index_of(&state.key) {
        Some(ix) => ix,
        None => return false,
    };
    let mut refresh = false;
    for (_, eix) in run.graph.in_edges(my_ix) {
        if let Some(edge) = run.graph.edge(eix) {
            if edge.notify && edge.take_refresh() {
                refresh = true;
            }
        }
    }
    refresh
}

/// After a converge with change: publish send values, raise refresh on
/// outgoing notify edges, and poke downstream workers.
fn propagate(shared: &Arc<Shared>, state: &Arc<State>) {
    if let Some(value) = state.send_cache.lock().clone() {
        let mutated = {
            let mut last = state.last_pushed.lock();
            if last.as_ref() != Some(&value) {
                *last = Some(value.clone());
                true
            } else {
                false
            }
        };
        if mutated {
            let targets = state.send_targets.lock().clone();
            let run = shared.graph.read();
            for target in targets {
                if let Some(receiver) = run.find_state(&target.recv_key) {
                    let mut recvs = receiver.recvs.lock();
                    if let Some(entry) = recvs.get_mut(&target.recv_field) {
                        entry.value = field_of(&value, &target.sender_field);
                        entry.changed = true;
                        trace!(
                            from = %state.key,
                            to = %target.recv_key,
                            field = %target.recv_field,
                            "send delivered"
                        );
                    }
                }
            }
        }
    }

    let run = shared.graph.read();
    let my_ix = match run.index_of(&state.key) {
        Some(ix) => ix,
        None => return,
    };
    let mut to_poke = Vec::new();
    for (dst, eix) in run.graph.out_edges(my_ix) {
        if let Some(edge) = run.graph.edge(eix) {
            if edge.notify {
                edge.set_refresh(true);
            }
        }
        if let Some(vertex) = run.graph.vertex(dst) {
            if !vertex.state.hidden() {
                to_poke.push(vertex.state.clone());
            }
        }
    }
    drop(run);
    for downstream in to_poke {
        downstream.poke();
    }
}

/// Sleep for the retry delay; false when cancellation interrupted it.
async fn sleep_or_cancel(state: &Arc<State>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = state.token.cancelled() => false,
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
