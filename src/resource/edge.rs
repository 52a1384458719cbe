//! Graph edges between resources

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// A directed link between two resources.
///
/// The `notify` bit marks the edge as a refresh carrier: when the source
/// converges with change, the pending `refresh` flag is raised and the
/// destination observes `Refresh() == true` on its next check-apply. The
/// pending flag is interior-mutable because workers flip it under the
/// engine's shared read lock.
#[derive(Debug)]
pub struct Edge {
    pub name: String,
    pub notify: bool,
    refresh: AtomicBool,
}

impl Edge {
    pub fn new(name: impl Into<String>, notify: bool) -> Self {
        Self {
            name: name.into(),
            notify,
            refresh: AtomicBool::new(false),
        }
    }

    /// Pending refresh flag.
    pub fn refresh(&self) -> bool {
        self.refresh.load(Ordering::SeqCst)
    }

    pub fn set_refresh(&self, pending: bool) {
        self.refresh.store(pending, Ordering::SeqCst);
    }

    /// Read and clear the pending refresh flag in one step.
    pub fn take_refresh(&self) -> bool {
        self.refresh.swap(false, Ordering::SeqCst)
    }
}

impl Clone for Edge {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            notify: self.notify,
            refresh: AtomicBool::new(self.refresh()),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
