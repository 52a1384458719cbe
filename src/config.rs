//! Engine configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Engine-wide configuration record
///
/// All fields have working defaults; construction through
/// `Config::default()` plus field tweaks is the expected path in tests
/// and embedding code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process-scoped prefix directory. The local KV lives under
    /// `{prefix}/value/`, per-resource scratch space under
    /// `{prefix}/var/{kind}/{name}/`.
    pub prefix: PathBuf,

    /// Hostname this engine instance identifies as in export records.
    pub hostname: String,

    /// Default polarity for the `rewatch` meta-param when a resource does
    /// not set it explicitly.
    pub default_rewatch: bool,

    /// When set, the engine reports convergence once every status token
    /// has been clean for this many seconds.
    pub converged_timeout: Option<u64>,

    /// Upper bound, in milliseconds, on how long a graph swap waits for a
    /// `realize` vertex to achieve its first converge before removing it
    /// anyway.
    pub realize_wait_ms: u64,

    /// Forward debug flag into resource handles.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: std::env::temp_dir().join("converge"),
            hostname: "localhost".to_string(),
            default_rewatch: false,
            converged_timeout: None,
            realize_wait_ms: 1000,
            debug: false,
        }
    }
}

impl Config {
    /// Validate the configuration record.
    pub fn validate(&self) -> EngineResult<()> {
        if self.prefix.as_os_str().is_empty() {
            return Err(EngineError::Validate("prefix must not be empty".to_string()));
        }
        if self.hostname.is_empty() {
            return Err(EngineError::Validate(
                "hostname must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding the local KV files.
    pub fn value_dir(&self) -> PathBuf {
        self.prefix.join("value")
    }

    /// Per-resource scratch directory.
    pub fn var_dir(&self, kind: &str, name: &str) -> PathBuf {
        self.prefix.join("var").join(kind).join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.default_rewatch);
        assert_eq!(config.converged_timeout, None);
    }

    #[test]
    fn empty_hostname_rejected() {
        let config = Config {
            hostname: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: Config = serde_json::from_str(r#"{"hostname": "h1"}"#)
            .unwrap_or_else(|_| Config::default());
        assert_eq!(config.hostname, "h1");
        assert_eq!(config.realize_wait_ms, 1000);
    }
}
