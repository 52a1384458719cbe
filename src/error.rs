//! Error types for the convergence engine
//!
//! Every subsystem funnels into [`EngineError`]. The worker retry layer
//! keys off [`EngineError::is_transient`] and [`EngineError::is_cancelled`]:
//! transient errors consume the per-resource retry budget, cancellation is
//! always a clean exit and never counted against it.

use thiserror::Error;

use crate::graph::GraphError;
use crate::types::TypeError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Comprehensive error type for the convergence engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Resource failed validation before it ever ran
    #[error("validate error: {0}")]
    Validate(String),

    /// Resource init failed; fatal for the vertex, aborts a graph swap
    #[error("init error: {0}")]
    Init(String),

    /// Watch loop failure, consumed by the retry budget
    #[error("watch error: {0}")]
    Watch(String),

    /// CheckApply failure, consumed by the retry budget
    #[error("apply error: {0}")]
    Apply(String),

    /// Clean shutdown via context cancellation
    #[error("operation cancelled")]
    Cancelled,

    /// Send/recv wiring impossibility, surfaced at graph assembly
    #[error("send/recv error: {0}")]
    SendRecv(String),

    /// Retry budget exhausted for a vertex
    #[error("retry budget exhausted for {0}")]
    RetryExhausted(String),

    /// Pause/resume protocol violation
    #[error("pause protocol error: {0}")]
    Pause(String),

    /// Local or cluster store failure
    #[error("store error: {0}")]
    Store(String),

    /// World (cluster side-effect) failure
    #[error("world error: {0}")]
    World(String),

    /// Engine is shutting down
    #[error("shutdown in progress")]
    Shutdown,

    /// Type unification failure
    #[error(transparent)]
    Type(#[from] TypeError),

    /// Graph structure failure (cycles, duplicates, incompatible merges)
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),

    /// Arbitrary error context from resource implementations
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error is a clean cancellation (never retried, never
    /// counted against the retry budget).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled | EngineError::Shutdown)
    }

    /// Whether the retry layer may consume budget and try again.
    ///
    /// Validation, init, type, and graph errors are permanent for the
    /// vertex or the assembly; everything runtime-flavored is transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Watch(_)
                | EngineError::Apply(_)
                | EngineError::Store(_)
                | EngineError::World(_)
                | EngineError::Other(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Store(format!("serialization: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_not_transient() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(!EngineError::Cancelled.is_transient());
    }

    #[test]
    fn apply_errors_are_transient() {
        let err = EngineError::Apply("disk full".to_string());
        assert!(err.is_transient());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn validate_errors_are_permanent() {
        let err = EngineError::Validate("bad field".to_string());
        assert!(!err.is_transient());
    }
}
