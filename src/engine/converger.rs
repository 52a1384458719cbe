//! Convergence coordinator
//!
//! Every worker registers status tokens here. A token is clean when its
//! holder believes the resource matches the desired state; the
//! timer-backed variant counts idle time instead, pausing whenever the
//! worker goes dirty. When every live token has been clean continuously
//! for the configured window, the coordinator reports convergence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::token::CancelToken;

/// One worker-held status token. Dropping it unregisters it.
pub struct ConvergerUid {
    inner: Arc<UidInner>,
}

struct UidInner {
    name: String,
    converged: AtomicBool,
    timer: Mutex<Option<Instant>>,
}

impl ConvergerUid {
    /// Report convergence status directly. Going dirty also stops the
    /// idle timer.
    pub fn set_converged(&self, converged: bool) {
        self.inner.converged.store(converged, Ordering::SeqCst);
        if !converged {
            *self.inner.timer.lock() = None;
        }
    }

    pub fn converged(&self) -> bool {
        self.inner.converged.load(Ordering::SeqCst)
    }

    /// Start (or keep) the idle timer running.
    pub fn start_timer(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.is_none() {
            *timer = Some(Instant::now());
        }
    }

    /// Stop the idle timer; the token is dirty again.
    pub fn stop_timer(&self) {
        *self.inner.timer.lock() = None;
    }

    fn effectively_converged(&self, window: Duration) -> bool {
        if self.converged() {
            return true;
        }
        match *self.inner.timer.lock() {
            Some(since) => since.elapsed() >= window,
            None => false,
        }
    }
}

/// The engine-wide coordinator.
pub struct Converger {
    timeout: Option<u64>,
    uids: Mutex<Vec<Weak<UidInner>>>,
    tx: watch::Sender<bool>,
}

impl Converger {
    /// `timeout` is the converged-timeout in seconds; `None` disables
    /// convergence reporting (tokens still track status for tests).
    pub fn new(timeout: Option<u64>) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            timeout,
            uids: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Register a status token under a diagnostic name.
    pub fn register(&self, name: impl Into<String>) -> ConvergerUid {
        let inner = Arc::new(UidInner {
            name: name.into(),
            converged: AtomicBool::new(false),
            timer: Mutex::new(None),
        });
        self.uids.lock().push(Arc::downgrade(&inner));
        ConvergerUid { inner }
    }

    /// Whether every live token is currently clean.
    pub fn status(&self) -> bool {
        let window = Duration::from_secs(self.timeout.unwrap_or(0));
        let mut uids = self.uids.lock();
        uids.retain(|weak| weak.strong_count() > 0);
        uids.iter().all(|weak| match weak.upgrade() {
            Some(inner) => ConvergerUid { inner }.effectively_converged(window),
            None => true,
        })
    }

    /// Subscribe to convergence transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Spawn the background poller. It reports true once all tokens have
    /// been clean continuously for the timeout window.
    pub fn run(self: Arc<Self>, ctx: CancelToken) -> JoinHandle<()> {
        let coordinator = self;
        tokio::spawn(async move {
            let timeout = match coordinator.timeout {
                Some(secs) => Duration::from_secs(secs),
                None => return,
            };
            let mut clean_since: Option<Instant> = None;
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if coordinator.status() {
                    let since = clean_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= timeout {
                        if !*coordinator.tx.borrow() {
                            debug!("converged for {:?}, reporting", timeout);
                        }
                        let _ = coordinator.tx.send(true);
                    }
                } else {
                    if clean_since.take().is_some() {
                        trace!("convergence window reset");
                    }
                    let _ = coordinator.tx.send(false);
                }
            }
        })
    }
}

impl std::fmt::Debug for ConvergerUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergerUid")
            .field("name", &self.inner.name)
            .field("converged", &self.converged())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tracks_registered_tokens() {
        let converger = Converger::new(None);
        assert!(converger.status()); // vacuously clean
        let uid = converger.register("a");
        assert!(!converger.status());
        uid.set_converged(true);
        assert!(converger.status());
    }

    #[test]
    fn dropping_a_token_unregisters_it() {
        let converger = Converger::new(None);
        let uid = converger.register("a");
        assert!(!converger.status());
        drop(uid);
        assert!(converger.status());
    }

    #[test]
    fn timer_counts_as_clean_after_window() {
        let converger = Converger::new(Some(0));
        let uid = converger.register("t");
        uid.start_timer();
        assert!(converger.status()); // zero window elapses immediately
        uid.stop_timer();
        assert!(!converger.status());
    }
}
