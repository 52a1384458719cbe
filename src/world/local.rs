//! Local on-disk KV and the in-process World implementation
//!
//! The KV keeps a mutex-guarded in-memory map in front of a file-per-key
//! directory. Writes go disk first, memory second; the on-disk format is
//! the base64 value plus a trailing newline, written through a rename so
//! partial writes never surface to readers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::engine::CancelToken;
use crate::error::{EngineError, EngineResult};

use super::{WireRes, World};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o600;

/// Local persistent KV with in-memory cache and watch notifications.
pub struct LocalKv {
    dir: PathBuf,
    cache: Mutex<HashMap<String, String>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::Sender<()>>>>,
}

impl LocalKv {
    /// Create a store rooted at `dir`. The directory is created lazily on
    /// first write.
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cache: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, key: &str) -> EngineResult<PathBuf> {
        if key.is_empty() || key.contains('/') || key == "." || key == ".." {
            return Err(EngineError::Store(format!("invalid key: {:?}", key)));
        }
        Ok(self.dir.join(key))
    }

    async fn ensure_dir(&self) -> EngineResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(DIR_MODE))
                .await?;
        }
        Ok(())
    }

    /// Read a value. `None` means absent.
    pub async fn get(&self, ctx: &CancelToken, key: &str) -> EngineResult<Option<String>> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let path = self.path_for(key)?;
        if let Some(value) = self.cache.lock().get(key) {
            return Ok(Some(value.clone()));
        }
        let raw = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let encoded = String::from_utf8_lossy(&raw);
        let decoded = BASE64
            .decode(encoded.trim_end_matches('\n'))
            .map_err(|e| EngineError::Store(format!("corrupt value for {}: {}", key, e)))?;
        let value = String::from_utf8(decoded)
            .map_err(|e| EngineError::Store(format!("corrupt value for {}: {}", key, e)))?;
        self.cache.lock().insert(key.to_string(), value.clone());
        Ok(Some(value))
    }

    /// Write a value: disk first (atomically, via rename), then memory,
    /// then watchers.
    pub async fn set(&self, ctx: &CancelToken, key: &str, value: &str) -> EngineResult<()> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let path = self.path_for(key)?;
        self.ensure_dir().await?;

        let mut encoded = BASE64.encode(value.as_bytes());
        encoded.push('\n');
        let tmp = self.dir.join(format!(".{}.tmp", key));
        tokio::fs::write(&tmp, encoded.as_bytes()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(FILE_MODE)).await?;
        }
        tokio::fs::rename(&tmp, &path).await?;

        self.cache.lock().insert(key.to_string(), value.to_string());
        self.notify(key);
        Ok(())
    }

    /// Delete a key. Missing keys are fine.
    pub async fn del(&self, ctx: &CancelToken, key: &str) -> EngineResult<()> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.cache.lock().remove(key);
        self.notify(key);
        Ok(())
    }

    /// Register a watcher for one key. The channel is size one and
    /// level-triggered: a pending notification absorbs later ones.
    pub fn watch(&self, key: &str) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.watchers
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn notify(&self, key: &str) {
        let mut watchers = self.watchers.lock();
        if let Some(senders) = watchers.get_mut(key) {
            senders.retain(|tx| match tx.try_send(()) {
                Ok(()) => true,
                // a pending notification already flags the change
                Err(mpsc::error::TrySendError::Full(())) => true,
                Err(mpsc::error::TrySendError::Closed(())) => false,
            });
        }
    }
}

/// In-process `World` implementation for a single host.
pub struct LocalWorld {
    hostname: String,
    kv: LocalKv,
    maps: Mutex<HashMap<String, HashMap<String, String>>>,
    exchange: Mutex<Vec<WireRes>>,
    ideal_size: AtomicU64,
    root: CancelToken,
}

impl LocalWorld {
    pub fn new(prefix: PathBuf, hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            kv: LocalKv::new(prefix.join("value")),
            maps: Mutex::new(HashMap::new()),
            exchange: Mutex::new(Vec::new()),
            ideal_size: AtomicU64::new(1),
            root: CancelToken::new(),
        }
    }

    /// Direct access to the backing KV, for tests and embedding code.
    pub fn kv(&self) -> &LocalKv {
        &self.kv
    }

    /// Every export currently in the exchange store.
    pub fn exported(&self) -> Vec<WireRes> {
        self.exchange.lock().clone()
    }
}

#[async_trait]
impl World for LocalWorld {
    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    async fn export_resource(&self, wire: WireRes) -> EngineResult<()> {
        let mut exchange = self.exchange.lock();
        if let Some(existing) = exchange.iter_mut().find(|e| e.triple() == wire.triple()) {
            *existing = wire;
        } else {
            exchange.push(wire);
        }
        Ok(())
    }

    async fn collect_resources(&self, kind: &str, host: &str) -> EngineResult<Vec<WireRes>> {
        Ok(self
            .exchange
            .lock()
            .iter()
            .filter(|e| e.kind == kind && (e.host == host || e.host == "*"))
            .cloned()
            .collect())
    }

    async fn unexport_resource(&self, kind: &str, name: &str, host: &str) -> EngineResult<()> {
        self.exchange
            .lock()
            .retain(|e| !(e.kind == kind && e.name == name && e.host == host));
        Ok(())
    }

    async fn ideal_cluster_size(&self) -> EngineResult<u64> {
        Ok(self.ideal_size.load(Ordering::SeqCst))
    }

    async fn set_ideal_cluster_size(&self, size: u64) -> EngineResult<()> {
        self.ideal_size.store(size, Ordering::SeqCst);
        Ok(())
    }

    async fn str_get(&self, key: &str) -> EngineResult<Option<String>> {
        self.kv.get(&self.root, key).await
    }

    async fn str_set(&self, key: &str, value: &str) -> EngineResult<()> {
        self.kv.set(&self.root, key, value).await
    }

    async fn str_del(&self, key: &str) -> EngineResult<()> {
        self.kv.del(&self.root, key).await
    }

    async fn str_watch(&self, key: &str) -> EngineResult<mpsc::Receiver<()>> {
        Ok(self.kv.watch(key))
    }

    async fn map_get(&self, namespace: &str, key: &str) -> EngineResult<Option<String>> {
        Ok(self
            .maps
            .lock()
            .get(namespace)
            .and_then(|m| m.get(key).cloned()))
    }

    async fn map_set(&self, namespace: &str, key: &str, value: &str) -> EngineResult<()> {
        self.maps
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn map_del(&self, namespace: &str, key: &str) -> EngineResult<()> {
        if let Some(map) = self.maps.lock().get_mut(namespace) {
            map.remove(key);
        }
        Ok(())
    }

    async fn map_all(&self, namespace: &str) -> EngineResult<HashMap<String, String>> {
        Ok(self
            .maps
            .lock()
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn scheduled(&self, _namespace: &str, count: usize) -> EngineResult<Vec<String>> {
        // single-host world: the only candidate is ourselves
        if count == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![self.hostname.clone()])
    }

    fn fs(&self, uri: &str) -> EngineResult<PathBuf> {
        match uri.strip_prefix("file://") {
            Some(path) => Ok(PathBuf::from(path)),
            None => Err(EngineError::World(format!("unsupported fs uri: {}", uri))),
        }
    }
}
