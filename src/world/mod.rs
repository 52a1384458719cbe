//! World interface: the cluster side-effect surface the engine consumes
//!
//! Everything the engine needs from its surroundings goes through this
//! trait: resource exchange keyed by `(kind, name, host)`, a string KV, a
//! string-map KV, the ideal-cluster-size gauge, a named scheduler hook,
//! and a filesystem opener. [`LocalWorld`] is the in-process
//! implementation backed by the local KV.

mod local;

pub use local::{LocalKv, LocalWorld};

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineResult;

/// A resource exported into the cluster store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRes {
    pub kind: String,
    pub name: String,
    /// Destination hostname; `*` matches any collector.
    pub host: String,
    /// Kind-specific wire encoding, possibly empty for placeholder
    /// exports.
    pub data: String,
}

impl WireRes {
    /// The `(kind, name, host)` triple as a flat key.
    pub fn triple(&self) -> (String, String, String) {
        (self.kind.clone(), self.name.clone(), self.host.clone())
    }
}

/// Cluster side-effect surface.
#[async_trait]
pub trait World: Send + Sync {
    /// Hostname this world instance identifies as.
    fn hostname(&self) -> String;

    /// Publish an exported resource. Idempotent: re-exporting the same
    /// triple replaces the stored payload.
    async fn export_resource(&self, wire: WireRes) -> EngineResult<()>;

    /// Collect exported resources of a kind addressed to `host` (matching
    /// wildcard exports too).
    async fn collect_resources(&self, kind: &str, host: &str) -> EngineResult<Vec<WireRes>>;

    /// Remove an exported resource by triple. Missing entries are fine.
    async fn unexport_resource(&self, kind: &str, name: &str, host: &str) -> EngineResult<()>;

    /// Ideal cluster size gauge.
    async fn ideal_cluster_size(&self) -> EngineResult<u64>;

    /// Idempotent set of the ideal cluster size gauge.
    async fn set_ideal_cluster_size(&self, size: u64) -> EngineResult<()>;

    // String KV.

    async fn str_get(&self, key: &str) -> EngineResult<Option<String>>;
    async fn str_set(&self, key: &str, value: &str) -> EngineResult<()>;
    async fn str_del(&self, key: &str) -> EngineResult<()>;

    /// Level-triggered change notifications for one key. The channel has
    /// capacity one; a pending notification coalesces with later ones.
    async fn str_watch(&self, key: &str) -> EngineResult<mpsc::Receiver<()>>;

    // String-map KV, namespaced.

    async fn map_get(&self, namespace: &str, key: &str) -> EngineResult<Option<String>>;
    async fn map_set(&self, namespace: &str, key: &str, value: &str) -> EngineResult<()>;
    async fn map_del(&self, namespace: &str, key: &str) -> EngineResult<()>;
    async fn map_all(&self, namespace: &str) -> EngineResult<HashMap<String, String>>;

    /// Named scheduler: pick up to `count` hosts for the given namespace.
    async fn scheduled(&self, namespace: &str, count: usize) -> EngineResult<Vec<String>>;

    /// Resolve a filesystem URI to a local path.
    fn fs(&self, uri: &str) -> EngineResult<PathBuf>;
}
