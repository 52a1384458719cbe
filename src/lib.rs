//! Declarative state convergence engine
//!
//! This crate continuously converges observable host state toward a
//! desired state expressed as a DAG of resources. It provides:
//! - A type system with Hindley-Milner style unification, backing the
//!   language frontend that produces resource descriptions
//! - A typed graph primitive with toposort and cycle diagnostics
//! - The resource model: identity, meta-params, and composable capability
//!   traits (grouping, send/recv, refresh, reversal, compatibility)
//! - Graph assembly from flat resource and edge lists, with duplicate
//!   merging, hidden variants, export bookkeeping, and send/recv wiring
//! - An auto-grouping rewrite with pluggable strategies
//! - The engine: one reactive worker per vertex (watch/check-apply loops,
//!   retries, rate limits, named semaphores, pause/resume) and an online
//!   graph swap that preserves matching workers
//! - The `World` interface for cluster side effects, plus a local
//!   file-backed KV with watch notifications

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod autogroup;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod interpret;
pub mod resource;
pub mod testing;
pub mod types;
pub mod world;

pub use config::Config;
pub use engine::{CancelToken, Engine, WorkerStatus};
pub use error::{EngineError, EngineResult};
pub use graph::{Graph, GraphError};
pub use interpret::{interpret, Assembly, EdgeSpec};
pub use resource::{
    BoxedRes, CheckResult, Edge, MetaParams, ResHandle, ResKey, Resource,
};
pub use types::{Type, TypeError};
pub use world::{LocalWorld, World};
