//! Test fixtures: instrumented resources for exercising the engine
//!
//! Each fixture returns a [`Probe`] alongside the resource so tests can
//! observe check/apply counts, refresh observations, received values, and
//! cleanups after the engine has taken ownership. These are real resource
//! implementations, not mocks of the engine: they go through interpret,
//! auto-grouping, and the worker lifecycle like any production resource.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::engine::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::resource::{
    AutoGroupMeta, BoxedRes, CheckResult, Compatible, Copyable, GraphQueryable, Groupable,
    HandleOps, MetaParams, Recvable, RecvValue, ResHandle, ResKey, Resource, ReversibleMeta,
    Reversible, Sendable,
};
use crate::types::Type;
use crate::world::World;

/// Shared observation surface for all fixtures.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    /// Total check-apply invocations.
    pub checks: Arc<AtomicU64>,
    /// Check-apply invocations that reported `changed`.
    pub applies: Arc<AtomicU64>,
    /// The refresh flag observed at each check-apply, in order.
    pub refresh_log: Arc<Mutex<Vec<bool>>>,
    /// Recv snapshots taken at each check-apply, in order.
    pub recv_log: Arc<Mutex<Vec<HashMap<String, RecvValue>>>>,
    /// Cleanup invocations.
    pub cleanups: Arc<AtomicU64>,
    /// The filtered-graph view observed at the latest check-apply.
    pub peers: Arc<Mutex<Vec<ResKey>>>,
}

impl Probe {
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn applies(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> u64 {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn refresh_log(&self) -> Vec<bool> {
        self.refresh_log.lock().clone()
    }

    pub fn recv_log(&self) -> Vec<HashMap<String, RecvValue>> {
        self.recv_log.lock().clone()
    }

    pub fn peers(&self) -> Vec<ResKey> {
        self.peers.lock().clone()
    }
}

/// Initialize test tracing once; safe to call from every test.
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A converge-once resource: the first applied check reports a change,
/// every later one reports the state already correct. Groupable and
/// copyable.
#[derive(Debug)]
pub struct NoopRes {
    kind: String,
    name: String,
    meta: MetaParams,
    comment: Mutex<String>,
    handle: Mutex<Option<ResHandle>>,
    applied: AtomicBool,
    probe: Probe,
    group_meta: AutoGroupMeta,
    children: Vec<BoxedRes>,
}

impl NoopRes {
    pub fn create(name: &str) -> (BoxedRes, Probe) {
        Self::with_comment(name, "")
    }

    pub fn with_comment(name: &str, comment: &str) -> (BoxedRes, Probe) {
        let probe = Probe::default();
        let res = NoopRes {
            kind: "noop".to_string(),
            name: name.to_string(),
            meta: MetaParams::default(),
            comment: Mutex::new(comment.to_string()),
            handle: Mutex::new(None),
            applied: AtomicBool::new(false),
            probe: probe.clone(),
            group_meta: AutoGroupMeta::default(),
            children: Vec::new(),
        };
        (Box::new(res), probe)
    }

    /// Registry-compatible builder; the probe is not observable.
    pub fn build(name: &str) -> BoxedRes {
        Self::create(name).0
    }
}

#[async_trait]
impl Resource for NoopRes {
    fn kind(&self) -> &str {
        &self.kind
    }
    fn set_kind(&mut self, kind: &str) {
        self.kind = kind.to_string();
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
    fn meta(&self) -> &MetaParams {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut MetaParams {
        &mut self.meta
    }

    fn validate(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn init(&self, handle: ResHandle) -> EngineResult<()> {
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn watch(&self, ctx: &CancelToken) -> EngineResult<()> {
        let handle = self.handle.lock().clone();
        if let Some(handle) = handle {
            handle.running();
        }
        ctx.cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, apply: bool) -> EngineResult<CheckResult> {
        self.probe.checks.fetch_add(1, Ordering::SeqCst);
        let handle = self.handle.lock().clone();
        let refresh = handle.as_ref().map(|h| h.refresh()).unwrap_or(false);
        self.probe.refresh_log.lock().push(refresh);
        if let Some(handle) = &handle {
            *self.probe.peers.lock() = handle.filtered_graph();
        }

        if self.applied.load(Ordering::SeqCst) {
            return Ok(CheckResult::unchanged());
        }
        if !apply {
            return Ok(CheckResult::pending());
        }
        self.applied.store(true, Ordering::SeqCst);
        self.probe.applies.fetch_add(1, Ordering::SeqCst);
        Ok(CheckResult::applied())
    }

    async fn cleanup(&self) -> EngineResult<()> {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cmp(&self, other: &dyn Resource) -> EngineResult<()> {
        let other = other
            .as_any()
            .downcast_ref::<NoopRes>()
            .ok_or_else(|| EngineError::Validate("kind mismatch in cmp".to_string()))?;
        let self_comment = self.comment.lock().clone();
        let other_comment = other.comment.lock().clone();
        if self_comment != other_comment {
            return Err(EngineError::Validate("comment differs".to_string()));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_groupable(&self) -> Option<&dyn Groupable> {
        Some(self)
    }
    fn as_groupable_mut(&mut self) -> Option<&mut dyn Groupable> {
        Some(self)
    }
    fn as_copyable(&self) -> Option<&dyn Copyable> {
        Some(self)
    }
    fn as_graph_queryable(&self) -> Option<&dyn GraphQueryable> {
        Some(self)
    }
}

impl GraphQueryable for NoopRes {
    fn query_allowed(&self, _requester: &ResKey) -> EngineResult<()> {
        Ok(())
    }
}

impl Groupable for NoopRes {
    fn auto_group_meta(&self) -> &AutoGroupMeta {
        &self.group_meta
    }

    fn group_cmp(&self, other: &dyn Resource) -> EngineResult<()> {
        if other.kind() == self.kind {
            Ok(())
        } else {
            Err(EngineError::Validate("cannot group across kinds".to_string()))
        }
    }

    fn group_res(&mut self, other: BoxedRes) -> EngineResult<()> {
        self.children.push(other);
        Ok(())
    }

    fn grouped(&self) -> Vec<&dyn Resource> {
        self.children.iter().map(|c| c.as_ref()).collect()
    }
}

impl Copyable for NoopRes {
    fn copy_res(&self) -> BoxedRes {
        let (mut copy, _) = NoopRes::with_comment(&self.name, &self.comment.lock());
        copy.set_kind(&self.kind);
        copy
    }

    fn copy_params_from(&self, other: &dyn Resource) -> EngineResult<()> {
        let other = other
            .as_any()
            .downcast_ref::<NoopRes>()
            .ok_or_else(|| EngineError::Validate("kind mismatch in copy".to_string()))?;
        *self.comment.lock() = other.comment.lock().clone();
        Ok(())
    }
}

/// An externally triggered resource: every message on the trigger channel
/// becomes a watch event, and every check-apply reports a change. A fail
/// budget makes the first N check-applies error, for retry tests.
#[derive(Debug)]
pub struct EventRes {
    kind: String,
    name: String,
    meta: MetaParams,
    handle: Mutex<Option<ResHandle>>,
    trigger: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    fail_budget: Arc<AtomicI64>,
    watch_failures: AtomicI64,
    quiet_first: AtomicBool,
    probe: Probe,
}

impl EventRes {
    pub fn create(name: &str) -> (BoxedRes, mpsc::UnboundedSender<()>, Probe) {
        let (res, tx, probe, _) = Self::new(name, 0, 0, false);
        (res, tx, probe)
    }

    pub fn with_failures(
        name: &str,
        failures: i64,
    ) -> (BoxedRes, mpsc::UnboundedSender<()>, Probe) {
        let (res, tx, probe, _) = Self::new(name, failures, 0, false);
        (res, tx, probe)
    }

    /// The first N watch attempts error before the watch subscribes.
    pub fn with_watch_failures(
        name: &str,
        failures: i64,
    ) -> (BoxedRes, mpsc::UnboundedSender<()>, Probe) {
        let (res, tx, probe, _) = Self::new(name, 0, failures, false);
        (res, tx, probe)
    }

    /// The startup check reports the state already correct, so only
    /// triggered events produce a converge-with-change.
    pub fn quiet(name: &str) -> (BoxedRes, mpsc::UnboundedSender<()>, Probe) {
        let (res, tx, probe, _) = Self::new(name, 0, 0, true);
        (res, tx, probe)
    }

    /// Like `quiet`, but also hands out the fail budget so tests can
    /// re-arm failures while the engine owns the resource.
    pub fn flaky(
        name: &str,
    ) -> (BoxedRes, mpsc::UnboundedSender<()>, Probe, Arc<AtomicI64>) {
        Self::new(name, 0, 0, true)
    }

    fn new(
        name: &str,
        failures: i64,
        watch_failures: i64,
        quiet_first: bool,
    ) -> (BoxedRes, mpsc::UnboundedSender<()>, Probe, Arc<AtomicI64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Probe::default();
        let fail_budget = Arc::new(AtomicI64::new(failures));
        let res = EventRes {
            kind: "event".to_string(),
            name: name.to_string(),
            meta: MetaParams::default(),
            handle: Mutex::new(None),
            trigger: Mutex::new(Some(rx)),
            fail_budget: fail_budget.clone(),
            watch_failures: AtomicI64::new(watch_failures),
            quiet_first: AtomicBool::new(quiet_first),
            probe: probe.clone(),
        };
        (Box::new(res), tx, probe, fail_budget)
    }
}

#[async_trait]
impl Resource for EventRes {
    fn kind(&self) -> &str {
        &self.kind
    }
    fn set_kind(&mut self, kind: &str) {
        self.kind = kind.to_string();
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
    fn meta(&self) -> &MetaParams {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut MetaParams {
        &mut self.meta
    }

    fn validate(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn init(&self, handle: ResHandle) -> EngineResult<()> {
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn watch(&self, ctx: &CancelToken) -> EngineResult<()> {
        if self.watch_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(EngineError::Watch("transient watch failure".to_string()));
        }
        self.watch_failures.store(0, Ordering::SeqCst);
        let handle = self.handle.lock().clone().ok_or_else(|| {
            EngineError::Watch("watch before init".to_string())
        })?;
        handle.running();
        let taken_trigger = self.trigger.lock().take();
        let mut trigger = match taken_trigger {
            Some(rx) => rx,
            None => {
                // watch restarted after an error: nothing more to observe
                ctx.cancelled().await;
                return Ok(());
            }
        };
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                fired = trigger.recv() => match fired {
                    Some(()) => handle.event().await,
                    None => {
                        ctx.cancelled().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn check_apply(&self, apply: bool) -> EngineResult<CheckResult> {
        self.probe.checks.fetch_add(1, Ordering::SeqCst);
        let refresh = self
            .handle
            .lock()
            .as_ref()
            .map(|h| h.refresh())
            .unwrap_or(false);
        self.probe.refresh_log.lock().push(refresh);

        if self.fail_budget.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(EngineError::Apply("transient failure".to_string()));
        }
        self.fail_budget.store(0, Ordering::SeqCst);
        if self.quiet_first.swap(false, Ordering::SeqCst) {
            return Ok(CheckResult::unchanged());
        }
        if !apply {
            return Ok(CheckResult::pending());
        }
        self.probe.applies.fetch_add(1, Ordering::SeqCst);
        Ok(CheckResult::applied())
    }

    async fn cleanup(&self) -> EngineResult<()> {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cmp(&self, other: &dyn Resource) -> EngineResult<()> {
        other
            .as_any()
            .downcast_ref::<EventRes>()
            .map(|_| ())
            .ok_or_else(|| EngineError::Validate("kind mismatch in cmp".to_string()))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A sending resource: publishes `{"value": <str>}` on every check-apply
/// and reports a change whenever the value differs from the last applied
/// one.
#[derive(Debug)]
pub struct ValueRes {
    kind: String,
    name: String,
    meta: MetaParams,
    handle: Mutex<Option<ResHandle>>,
    value: Mutex<String>,
    last_applied: Mutex<Option<String>>,
    probe: Probe,
}

impl ValueRes {
    pub fn create(name: &str, value: &str) -> (BoxedRes, Probe) {
        let probe = Probe::default();
        let res = ValueRes {
            kind: "value".to_string(),
            name: name.to_string(),
            meta: MetaParams::default(),
            handle: Mutex::new(None),
            value: Mutex::new(value.to_string()),
            last_applied: Mutex::new(None),
            probe: probe.clone(),
        };
        (Box::new(res), probe)
    }
}

#[async_trait]
impl Resource for ValueRes {
    fn kind(&self) -> &str {
        &self.kind
    }
    fn set_kind(&mut self, kind: &str) {
        self.kind = kind.to_string();
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
    fn meta(&self) -> &MetaParams {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut MetaParams {
        &mut self.meta
    }

    fn validate(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn init(&self, handle: ResHandle) -> EngineResult<()> {
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn watch(&self, ctx: &CancelToken) -> EngineResult<()> {
        let handle = self.handle.lock().clone();
        if let Some(handle) = handle {
            handle.running();
        }
        ctx.cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, apply: bool) -> EngineResult<CheckResult> {
        self.probe.checks.fetch_add(1, Ordering::SeqCst);
        let handle = self.handle.lock().clone().ok_or_else(|| {
            EngineError::Apply("check-apply before init".to_string())
        })?;
        let value = self.value.lock().clone();
        handle.send(json!({ "value": value }))?;

        let changed = self.last_applied.lock().as_deref() != Some(value.as_str());
        if !changed {
            return Ok(CheckResult::unchanged());
        }
        if !apply {
            return Ok(CheckResult::pending());
        }
        *self.last_applied.lock() = Some(value);
        self.probe.applies.fetch_add(1, Ordering::SeqCst);
        Ok(CheckResult::applied())
    }

    async fn cleanup(&self) -> EngineResult<()> {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cmp(&self, other: &dyn Resource) -> EngineResult<()> {
        let other = other
            .as_any()
            .downcast_ref::<ValueRes>()
            .ok_or_else(|| EngineError::Validate("kind mismatch in cmp".to_string()))?;
        if *self.value.lock() != *other.value.lock() {
            return Err(EngineError::Validate("value differs".to_string()));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_sendable(&self) -> Option<&dyn Sendable> {
        Some(self)
    }
    fn as_copyable(&self) -> Option<&dyn Copyable> {
        Some(self)
    }
    fn as_compatible(&self) -> Option<&dyn Compatible> {
        Some(self)
    }
}

impl Compatible for ValueRes {
    fn adapts(&self, other: &dyn Resource) -> EngineResult<()> {
        let other = other
            .as_any()
            .downcast_ref::<ValueRes>()
            .ok_or_else(|| EngineError::Validate("kind mismatch in adapts".to_string()))?;
        if self.name != other.name {
            return Err(EngineError::Validate("name differs".to_string()));
        }
        Ok(())
    }

    fn merge(&self, other: &dyn Resource) -> EngineResult<BoxedRes> {
        let other = other
            .as_any()
            .downcast_ref::<ValueRes>()
            .ok_or_else(|| EngineError::Validate("kind mismatch in merge".to_string()))?;
        // lexicographic max keeps merge associative and commutative
        let mine = self.value.lock().clone();
        let theirs = other.value.lock().clone();
        Ok(ValueRes::create(&self.name, mine.max(theirs).as_str()).0)
    }
}

impl Sendable for ValueRes {
    fn send_fields(&self) -> HashMap<String, Type> {
        HashMap::from([("value".to_string(), Type::Str)])
    }
}

impl Copyable for ValueRes {
    fn copy_res(&self) -> BoxedRes {
        ValueRes::create(&self.name, &self.value.lock()).0
    }

    fn copy_params_from(&self, other: &dyn Resource) -> EngineResult<()> {
        let other = other
            .as_any()
            .downcast_ref::<ValueRes>()
            .ok_or_else(|| EngineError::Validate("kind mismatch in copy".to_string()))?;
        *self.value.lock() = other.value.lock().clone();
        Ok(())
    }
}

/// A receiving resource: snapshots its recv map on every check-apply and
/// reports a change whenever any received field changed.
#[derive(Debug)]
pub struct SinkRes {
    kind: String,
    name: String,
    meta: MetaParams,
    handle: Mutex<Option<ResHandle>>,
    probe: Probe,
}

impl SinkRes {
    pub fn create(name: &str) -> (BoxedRes, Probe) {
        let probe = Probe::default();
        let res = SinkRes {
            kind: "sink".to_string(),
            name: name.to_string(),
            meta: MetaParams::default(),
            handle: Mutex::new(None),
            probe: probe.clone(),
        };
        (Box::new(res), probe)
    }
}

#[async_trait]
impl Resource for SinkRes {
    fn kind(&self) -> &str {
        &self.kind
    }
    fn set_kind(&mut self, kind: &str) {
        self.kind = kind.to_string();
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
    fn meta(&self) -> &MetaParams {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut MetaParams {
        &mut self.meta
    }

    fn validate(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn init(&self, handle: ResHandle) -> EngineResult<()> {
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn watch(&self, ctx: &CancelToken) -> EngineResult<()> {
        let handle = self.handle.lock().clone();
        if let Some(handle) = handle {
            handle.running();
        }
        ctx.cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, apply: bool) -> EngineResult<CheckResult> {
        self.probe.checks.fetch_add(1, Ordering::SeqCst);
        let handle = self.handle.lock().clone().ok_or_else(|| {
            EngineError::Apply("check-apply before init".to_string())
        })?;
        let snapshot = handle.recv();
        let changed = snapshot.values().any(|v| v.changed);
        self.probe.recv_log.lock().push(snapshot);
        if !changed {
            return Ok(CheckResult::unchanged());
        }
        if !apply {
            return Ok(CheckResult::pending());
        }
        self.probe.applies.fetch_add(1, Ordering::SeqCst);
        Ok(CheckResult::applied())
    }

    async fn cleanup(&self) -> EngineResult<()> {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cmp(&self, other: &dyn Resource) -> EngineResult<()> {
        other
            .as_any()
            .downcast_ref::<SinkRes>()
            .map(|_| ())
            .ok_or_else(|| EngineError::Validate("kind mismatch in cmp".to_string()))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_recvable(&self) -> Option<&dyn Recvable> {
        Some(self)
    }
}

impl Recvable for SinkRes {
    fn recv_fields(&self) -> HashMap<String, Type> {
        HashMap::from([("value".to_string(), Type::Str)])
    }
}

/// A mergeable resource carrying a string set; two with the same name
/// adapt and merge by union. Exercises the Compatible dedup path.
#[derive(Debug)]
pub struct SetRes {
    kind: String,
    name: String,
    meta: MetaParams,
    values: BTreeSet<String>,
    probe: Probe,
}

impl SetRes {
    pub fn create(name: &str, values: &[&str]) -> BoxedRes {
        Box::new(SetRes {
            kind: "set".to_string(),
            name: name.to_string(),
            meta: MetaParams::default(),
            values: values.iter().map(|v| (*v).to_string()).collect(),
            probe: Probe::default(),
        })
    }

    pub fn values(&self) -> &BTreeSet<String> {
        &self.values
    }
}

#[async_trait]
impl Resource for SetRes {
    fn kind(&self) -> &str {
        &self.kind
    }
    fn set_kind(&mut self, kind: &str) {
        self.kind = kind.to_string();
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
    fn meta(&self) -> &MetaParams {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut MetaParams {
        &mut self.meta
    }

    fn validate(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn init(&self, _handle: ResHandle) -> EngineResult<()> {
        Ok(())
    }

    async fn watch(&self, ctx: &CancelToken) -> EngineResult<()> {
        ctx.cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, _apply: bool) -> EngineResult<CheckResult> {
        self.probe.checks.fetch_add(1, Ordering::SeqCst);
        Ok(CheckResult::unchanged())
    }

    async fn cleanup(&self) -> EngineResult<()> {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cmp(&self, other: &dyn Resource) -> EngineResult<()> {
        let other = other
            .as_any()
            .downcast_ref::<SetRes>()
            .ok_or_else(|| EngineError::Validate("kind mismatch in cmp".to_string()))?;
        if self.values != other.values {
            return Err(EngineError::Validate("values differ".to_string()));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_compatible(&self) -> Option<&dyn Compatible> {
        Some(self)
    }
}

impl Compatible for SetRes {
    fn adapts(&self, other: &dyn Resource) -> EngineResult<()> {
        let other = other
            .as_any()
            .downcast_ref::<SetRes>()
            .ok_or_else(|| EngineError::Validate("kind mismatch in adapts".to_string()))?;
        if self.name != other.name {
            return Err(EngineError::Validate("name differs".to_string()));
        }
        Ok(())
    }

    fn merge(&self, other: &dyn Resource) -> EngineResult<BoxedRes> {
        let other = other
            .as_any()
            .downcast_ref::<SetRes>()
            .ok_or_else(|| EngineError::Validate("kind mismatch in merge".to_string()))?;
        let mut values = self.values.clone();
        values.extend(other.values.iter().cloned());
        Ok(Box::new(SetRes {
            kind: self.kind.clone(),
            name: self.name.clone(),
            meta: self.meta.clone(),
            values,
            probe: Probe::default(),
        }))
    }
}

/// A converge-once resource that leaves a reverse behind: on removal the
/// engine commits `undo-<name>` to the cluster store so a later
/// reconciliation can unwind it.
#[derive(Debug)]
pub struct UndoRes {
    kind: String,
    name: String,
    meta: MetaParams,
    reversible_meta: ReversibleMeta,
    handle: Mutex<Option<ResHandle>>,
    applied: AtomicBool,
    probe: Probe,
}

impl UndoRes {
    pub fn create(name: &str) -> (BoxedRes, Probe) {
        let probe = Probe::default();
        let res = UndoRes {
            kind: "undo".to_string(),
            name: name.to_string(),
            meta: MetaParams::default(),
            reversible_meta: ReversibleMeta { enabled: true },
            handle: Mutex::new(None),
            applied: AtomicBool::new(false),
            probe: probe.clone(),
        };
        (Box::new(res), probe)
    }
}

#[async_trait]
impl Resource for UndoRes {
    fn kind(&self) -> &str {
        &self.kind
    }
    fn set_kind(&mut self, kind: &str) {
        self.kind = kind.to_string();
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
    fn meta(&self) -> &MetaParams {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut MetaParams {
        &mut self.meta
    }

    fn validate(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn init(&self, handle: ResHandle) -> EngineResult<()> {
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn watch(&self, ctx: &CancelToken) -> EngineResult<()> {
        let handle = self.handle.lock().clone();
        if let Some(handle) = handle {
            handle.running();
        }
        ctx.cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, apply: bool) -> EngineResult<CheckResult> {
        self.probe.checks.fetch_add(1, Ordering::SeqCst);
        if self.applied.load(Ordering::SeqCst) {
            return Ok(CheckResult::unchanged());
        }
        if !apply {
            return Ok(CheckResult::pending());
        }
        self.applied.store(true, Ordering::SeqCst);
        self.probe.applies.fetch_add(1, Ordering::SeqCst);
        Ok(CheckResult::applied())
    }

    async fn cleanup(&self) -> EngineResult<()> {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cmp(&self, other: &dyn Resource) -> EngineResult<()> {
        other
            .as_any()
            .downcast_ref::<UndoRes>()
            .map(|_| ())
            .ok_or_else(|| EngineError::Validate("kind mismatch in cmp".to_string()))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_reversible(&self) -> Option<&dyn Reversible> {
        Some(self)
    }
}

impl Reversible for UndoRes {
    fn reversible_meta(&self) -> &ReversibleMeta {
        &self.reversible_meta
    }

    fn reversed(&self) -> EngineResult<BoxedRes> {
        Ok(NoopRes::create(&format!("undo-{}", self.name)).0)
    }
}

/// Standalone handle for unit-testing resources outside the engine.
pub fn mock_handle(world: Arc<dyn World>, key: ResKey) -> ResHandle {
    struct MockOps {
        sent: Mutex<Option<serde_json::Value>>,
    }

    #[async_trait]
    impl HandleOps for MockOps {
        fn running(&self) {}
        async fn event(&self) {}
        fn refresh(&self) -> bool {
            false
        }
        fn send(&self, value: serde_json::Value) -> EngineResult<()> {
            *self.sent.lock() = Some(value);
            Ok(())
        }
        fn recv(&self) -> HashMap<String, RecvValue> {
            HashMap::new()
        }
        fn filtered_graph(&self) -> Vec<ResKey> {
            Vec::new()
        }
        fn var_dir(&self, sub: &str) -> EngineResult<std::path::PathBuf> {
            let dir = std::env::temp_dir().join("converge-mock").join(sub);
            std::fs::create_dir_all(&dir)?;
            Ok(dir)
        }
    }

    ResHandle::new(
        Arc::new(MockOps {
            sent: Mutex::new(None),
        }),
        world,
        key,
        false,
    )
}
