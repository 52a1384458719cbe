//! Resource meta-parameters
//!
//! The fixed configuration record every resource carries, independent of
//! its kind-specific parameters. Serialized with lowercase keys.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Meta-parameters recognized by the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetaParams {
    /// Check but do not apply.
    pub noop: bool,

    /// Retry budget for watch and check-apply failures. -1 is unlimited.
    pub retry: i64,

    /// On a successful check-apply, restore the retry budget.
    #[serde(rename = "retryreset")]
    pub retry_reset: bool,

    /// Inter-retry delay, in milliseconds.
    pub delay: u64,

    /// If nonzero, replace the native watch with a fixed-interval poll of
    /// this many seconds.
    pub poll: u32,

    /// Token-bucket rate for events coming out of watch, in events per
    /// second. Infinite means no limit.
    #[serde(with = "rate")]
    pub limit: f64,

    /// Token-bucket burst size. Zero is valid only with an infinite limit.
    pub burst: u32,

    /// Named counting semaphores held around check-apply, of the form
    /// `id` or `id:N`. `foo` and `foo:1` are distinct keys.
    pub sema: Vec<String>,

    /// During a graph swap, discard and recreate the worker if it had
    /// errored, instead of preserving it. When unset, the engine default
    /// applies.
    pub rewatch: Option<bool>,

    /// Guarantee at least one successful converge before the vertex may be
    /// removed by a graph swap.
    pub realize: bool,

    /// Placeholder / export-only vertex: may not send, and duplicates of
    /// the same `(kind, name)` are permitted alongside it.
    pub hidden: bool,

    /// Hostnames this resource is exported to; `*` means any.
    pub export: Vec<String>,

    /// On resource replacement during a graph swap, reset retry and state
    /// counters instead of preserving them.
    pub reset: bool,
}

impl Default for MetaParams {
    fn default() -> Self {
        Self {
            noop: false,
            retry: 0,
            retry_reset: false,
            delay: 0,
            poll: 0,
            limit: f64::INFINITY,
            burst: 0,
            sema: Vec::new(),
            rewatch: None,
            realize: false,
            hidden: false,
            export: Vec::new(),
            reset: false,
        }
    }
}

impl MetaParams {
    /// Validate the record.
    pub fn validate(&self) -> EngineResult<()> {
        if self.retry < -1 {
            return Err(EngineError::Validate(format!(
                "retry must be >= -1, got {}",
                self.retry
            )));
        }
        if self.limit.is_finite() && self.limit <= 0.0 {
            return Err(EngineError::Validate(format!(
                "limit must be positive or infinite, got {}",
                self.limit
            )));
        }
        if self.burst == 0 && self.limit.is_finite() {
            return Err(EngineError::Validate(
                "burst of zero is only valid with an infinite limit".to_string(),
            ));
        }
        for id in &self.sema {
            parse_sema(id)?;
        }
        for host in &self.export {
            if host.is_empty() {
                return Err(EngineError::Validate(
                    "export hostname must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The effective rewatch polarity given the engine default.
    pub fn rewatch_or(&self, engine_default: bool) -> bool {
        self.rewatch.unwrap_or(engine_default)
    }
}

/// Parse a semaphore id of the form `id` or `id:N`.
///
/// Returns `(key, count)`. The key is the full id string, so `foo` and
/// `foo:1` name different semaphores even though both have count one.
pub fn parse_sema(id: &str) -> EngineResult<(String, usize)> {
    if id.is_empty() {
        return Err(EngineError::Validate("empty semaphore id".to_string()));
    }
    match id.rsplit_once(':') {
        Some((name, count)) => {
            if name.is_empty() {
                return Err(EngineError::Validate(format!(
                    "malformed semaphore id: {}",
                    id
                )));
            }
            let n: usize = count.parse().map_err(|_| {
                EngineError::Validate(format!("malformed semaphore count in: {}", id))
            })?;
            if n == 0 {
                return Err(EngineError::Validate(format!(
                    "semaphore count must be positive in: {}",
                    id
                )));
            }
            Ok((id.to_string(), n))
        }
        None => Ok((id.to_string(), 1)),
    }
}

/// Serde for the limit field: JSON has no infinity, so the unlimited rate
/// round-trips as null and also accepts the strings "inf" and "∞".
mod rate {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(limit: &f64, s: S) -> Result<S::Ok, S::Error> {
        if limit.is_finite() {
            s.serialize_f64(*limit)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(f64),
            Text(String),
            None,
        }
        match Option::<Raw>::deserialize(d)? {
            None | Some(Raw::None) => Ok(f64::INFINITY),
            Some(Raw::Num(n)) => Ok(n),
            Some(Raw::Text(s)) if s == "inf" || s == "∞" => Ok(f64::INFINITY),
            Some(Raw::Text(s)) => Err(D::Error::custom(format!("invalid rate: {}", s))),
        }
    }
}
