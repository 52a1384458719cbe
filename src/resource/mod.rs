//! Resource model
//!
//! A resource is identified by `(kind, name)` and driven through a
//! validate → init → watch/check-apply → cleanup lifecycle by its worker.
//! Capabilities beyond the core lifecycle are small composable traits
//! discovered at runtime through the `as_*` accessor methods; a resource
//! opts in by overriding the accessor to return itself.

mod edge;
mod meta;
mod ops;
mod registry;
mod sendrecv;

pub use edge::Edge;
pub use meta::{parse_sema, MetaParams};
pub use ops::{res_cmp, res_copy, res_merge};
pub use registry::{new_resource, register, registered_kinds, ResBuilder};
pub use sendrecv::{field_of, RecvMap, RecvValue, RecvWire};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::CancelToken;
use crate::error::EngineResult;
use crate::types::Type;
use crate::world::World;

/// A boxed resource, the unit the interpreter and auto-grouper move around.
pub type BoxedRes = Box<dyn Resource>;

/// Unique identity of a (non-hidden) resource in a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResKey {
    pub kind: String,
    pub name: String,
}

impl ResKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn of(res: &dyn Resource) -> Self {
        Self::new(res.kind(), res.name())
    }
}

impl fmt::Display for ResKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.name)
    }
}

/// Outcome of a check-apply cycle.
///
/// `check_ok` means the resource is in (or was verified to be in) the
/// desired state; `changed` means work was performed to get there. A
/// `check_ok == false` result with no error is a noop-mode "work pending"
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub check_ok: bool,
    pub changed: bool,
}

impl CheckResult {
    /// Already in the desired state; nothing was done.
    pub fn unchanged() -> Self {
        Self {
            check_ok: true,
            changed: false,
        }
    }

    /// The desired state was reached by applying changes.
    pub fn applied() -> Self {
        Self {
            check_ok: true,
            changed: true,
        }
    }

    /// Work is needed but was not applied (noop mode).
    pub fn pending() -> Self {
        Self {
            check_ok: false,
            changed: false,
        }
    }
}

/// The core resource lifecycle trait.
///
/// Mutating accessors (`set_kind`, `set_name`, `meta_mut`) are only used
/// before a resource enters the executable graph; once a worker owns the
/// resource it is shared behind an `Arc` and all lifecycle calls take
/// `&self`, with implementations using interior mutability for their own
/// runtime state.
#[async_trait]
pub trait Resource: Send + Sync + fmt::Debug {
    fn kind(&self) -> &str;
    fn set_kind(&mut self, kind: &str);
    fn name(&self) -> &str;
    fn set_name(&mut self, name: &str);

    fn meta(&self) -> &MetaParams;
    fn meta_mut(&mut self) -> &mut MetaParams;

    /// Static validation before the resource ever runs.
    fn validate(&self) -> EngineResult<()>;

    /// One-time setup with the engine-supplied handle. The handle is the
    /// resource's only channel back into the engine; implementations
    /// store it for use in watch and check-apply.
    async fn init(&self, handle: ResHandle) -> EngineResult<()>;

    /// Own the watch loop: call `handle.running()` exactly once when
    /// subscribed, then `handle.event()` on every observed change, and
    /// return promptly when `ctx` is cancelled. Resources relying on
    /// `meta.poll` never have this called.
    async fn watch(&self, ctx: &CancelToken) -> EngineResult<()>;

    /// Converge one step: check the observed state and, when `apply` is
    /// true, repair it.
    async fn check_apply(&self, apply: bool) -> EngineResult<CheckResult>;

    /// Teardown when the vertex leaves the graph. Called exactly once.
    async fn cleanup(&self) -> EngineResult<()>;

    /// Kind-specific parameter comparison. Err means "not equivalent".
    fn cmp(&self, other: &dyn Resource) -> EngineResult<()>;

    /// Downcast support for kind-specific `cmp`/`adapts` implementations.
    fn as_any(&self) -> &dyn Any;

    // Capability discovery. A resource that implements a capability trait
    // overrides the matching accessor to return itself.

    fn as_groupable(&self) -> Option<&dyn Groupable> {
        None
    }
    fn as_groupable_mut(&mut self) -> Option<&mut dyn Groupable> {
        None
    }
    fn as_edgeable(&self) -> Option<&dyn Edgeable> {
        None
    }
    fn as_refreshable(&self) -> Option<&dyn Refreshable> {
        None
    }
    fn as_sendable(&self) -> Option<&dyn Sendable> {
        None
    }
    fn as_recvable(&self) -> Option<&dyn Recvable> {
        None
    }
    fn as_reversible(&self) -> Option<&dyn Reversible> {
        None
    }
    fn as_graph_queryable(&self) -> Option<&dyn GraphQueryable> {
        None
    }
    fn as_compatible(&self) -> Option<&dyn Compatible> {
        None
    }
    fn as_copyable(&self) -> Option<&dyn Copyable> {
        None
    }
    fn as_exportable(&self) -> Option<&dyn Exportable> {
        None
    }
    fn as_interruptable(&self) -> Option<&dyn Interruptable> {
        None
    }
}

impl fmt::Display for dyn Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind(), self.name())
    }
}

/// Meta block for automatic edge generation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AutoEdgeMeta {
    pub disabled: bool,
}

/// Meta block for automatic grouping.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AutoGroupMeta {
    pub disabled: bool,
}

/// Meta block for reversal on removal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReversibleMeta {
    pub enabled: bool,
}

/// Can produce automatic edges and the UIDs they match on.
pub trait Edgeable: Send + Sync {
    fn auto_edge_meta(&self) -> &AutoEdgeMeta;
}

/// Can be merged with another resource of a compatible kind.
pub trait Groupable: Send + Sync {
    fn auto_group_meta(&self) -> &AutoGroupMeta;

    /// Whether `other` may be grouped under this resource.
    fn group_cmp(&self, other: &dyn Resource) -> EngineResult<()>;

    /// Absorb `other` as a grouped child. The parent owns the child from
    /// here on and is responsible for running its semantics.
    fn group_res(&mut self, other: BoxedRes) -> EngineResult<()>;

    /// Grouped children, if any.
    fn grouped(&self) -> Vec<&dyn Resource>;

    fn is_grouped(&self) -> bool {
        !self.grouped().is_empty()
    }
}

/// Observes refresh notifications from incoming notify edges.
pub trait Refreshable: Send + Sync {
    fn refresh(&self) -> bool;
    /// Set by the engine around each check-apply; implementations store
    /// the flag with interior mutability.
    fn set_refresh(&self, refresh: bool);
}

/// Publishes named, typed output fields during check-apply.
pub trait Sendable: Send + Sync {
    fn send_fields(&self) -> HashMap<String, Type>;
}

/// Consumes named, typed input fields from an upstream sender.
pub trait Recvable: Send + Sync {
    fn recv_fields(&self) -> HashMap<String, Type>;
}

/// Produces a reverse resource to clean up when removed from the graph.
pub trait Reversible: Send + Sync {
    fn reversible_meta(&self) -> &ReversibleMeta;
    fn reversed(&self) -> EngineResult<BoxedRes>;
}

/// Willing to appear in a peer's filtered graph view.
pub trait GraphQueryable: Send + Sync {
    /// Err means "do not show me to this requester".
    fn query_allowed(&self, requester: &ResKey) -> EngineResult<()>;
}

/// May equal another same-keyed resource without identity: `adapts`
/// decides compatibility, `merge` folds two compatible resources into
/// one. Merge must be associative and commutative up to `res_cmp`.
pub trait Compatible: Send + Sync {
    fn adapts(&self, other: &dyn Resource) -> EngineResult<()>;
    fn merge(&self, other: &dyn Resource) -> EngineResult<BoxedRes>;
}

/// Can duplicate its public parameters.
pub trait Copyable: Send + Sync {
    /// A fresh resource carrying the same public parameters.
    fn copy_res(&self) -> BoxedRes;

    /// Clone `other`'s public parameters over this resource in place,
    /// preserving runtime state. Used by the graph swap for kept vertices
    /// whose parameters changed.
    fn copy_params_from(&self, other: &dyn Resource) -> EngineResult<()>;
}

/// Custom wire encoding for cluster export.
pub trait Exportable: Send + Sync {
    fn to_wire(&self) -> EngineResult<String>;
}

/// Supports a hard kick for fast shutdown after cancellation.
pub trait Interruptable: Send + Sync {
    fn interrupt(&self);
}

/// Engine-side operations behind the resource handle.
#[async_trait]
pub trait HandleOps: Send + Sync {
    /// Watch is subscribed; must be called exactly once per watch start.
    fn running(&self);
    /// Observed state may have changed.
    async fn event(&self);
    /// Whether a refresh notification is pending for the current cycle.
    fn refresh(&self) -> bool;
    /// Publish send output for downstream receivers.
    fn send(&self, value: Value) -> EngineResult<()>;
    /// Snapshot of received fields. Change flags are consumed by the read.
    fn recv(&self) -> HashMap<String, RecvValue>;
    /// Peer resources willing to be seen by this one.
    fn filtered_graph(&self) -> Vec<ResKey>;
    /// Per-resource scratch directory, created on demand.
    fn var_dir(&self, sub: &str) -> EngineResult<PathBuf>;
}

/// The handle a resource receives at init time: its entire surface back
/// into the engine.
#[derive(Clone)]
pub struct ResHandle {
    pub(crate) ops: Arc<dyn HandleOps>,
    pub(crate) world: Arc<dyn World>,
    pub(crate) key: ResKey,
    pub(crate) debug: bool,
}

impl ResHandle {
    pub fn new(
        ops: Arc<dyn HandleOps>,
        world: Arc<dyn World>,
        key: ResKey,
        debug: bool,
    ) -> Self {
        Self {
            ops,
            world,
            key,
            debug,
        }
    }

    pub fn running(&self) {
        self.ops.running();
    }

    pub async fn event(&self) {
        self.ops.event().await;
    }

    pub fn refresh(&self) -> bool {
        self.ops.refresh()
    }

    pub fn send(&self, value: Value) -> EngineResult<()> {
        self.ops.send(value)
    }

    pub fn recv(&self) -> HashMap<String, RecvValue> {
        self.ops.recv()
    }

    pub fn filtered_graph(&self) -> Vec<ResKey> {
        self.ops.filtered_graph()
    }

    pub fn var_dir(&self, sub: &str) -> EngineResult<PathBuf> {
        self.ops.var_dir(sub)
    }

    pub fn world(&self) -> Arc<dyn World> {
        self.world.clone()
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn key(&self) -> &ResKey {
        &self.key
    }

    /// Structured log line attributed to this resource.
    pub fn logf(&self, args: fmt::Arguments<'_>) {
        tracing::info!(kind = %self.key.kind, name = %self.key.name, "{}", args);
    }
}

impl fmt::Debug for ResHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResHandle")
            .field("key", &self.key)
            .field("debug", &self.debug)
            .finish()
    }
}
