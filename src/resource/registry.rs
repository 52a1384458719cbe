//! Process-wide resource kind registry
//!
//! Populated through module-level registration at program startup and
//! frozen (by convention) once interpret runs; the lock exists for the
//! registration window only.

use std::collections::HashMap;

use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::error::{EngineError, EngineResult};

use super::BoxedRes;

/// Constructor for a resource kind. Receives the resource name.
pub type ResBuilder = fn(name: &str) -> BoxedRes;

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, ResBuilder>> = RwLock::new(HashMap::new());
}

/// Register a resource kind. Re-registering the same builder is a no-op;
/// registering a different builder under an existing kind is an error.
pub fn register(kind: &str, builder: ResBuilder) -> EngineResult<()> {
    let mut registry = REGISTRY.write();
    if let Some(existing) = registry.get(kind) {
        if *existing as usize == builder as usize {
            return Ok(());
        }
        return Err(EngineError::Validate(format!(
            "kind {} is already registered",
            kind
        )));
    }
    registry.insert(kind.to_string(), builder);
    Ok(())
}

/// Construct a resource of a registered kind.
pub fn new_resource(kind: &str, name: &str) -> EngineResult<BoxedRes> {
    let builder = {
        let registry = REGISTRY.read();
        registry.get(kind).copied()
    };
    let builder = builder.ok_or_else(|| {
        EngineError::Validate(format!("unknown resource kind: {}", kind))
    })?;
    let mut res = builder(name);
    res.set_kind(kind);
    res.set_name(name);
    Ok(res)
}

/// All registered kinds, sorted.
pub fn registered_kinds() -> Vec<String> {
    let mut kinds: Vec<String> = REGISTRY.read().keys().cloned().collect();
    kinds.sort();
    kinds
}
