//! Configuration for the download engine and the task manager
//!
//! Per-task overrides (`TaskOptions`) are persisted with the task record and
//! merged over the process-wide defaults (`EngineOptions`) when a task is
//! constructed. Every task owns its resolved snapshot; defaults are never
//! shared mutable state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// Plain HTTP streaming engine (default)
    #[default]
    Http,
    // Future backends can be added here:
    // /// Drive an external extractor process
    // External,
}

/// Per-task option overrides supplied at creation time.
///
/// Every field is optional; unset fields fall back to the process-wide
/// defaults at task construction. The bundle is persisted verbatim so a
/// reconstituted task re-merges against the current defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskOptions {
    /// Requested media format hint
    #[serde(default)]
    pub format: Option<String>,

    /// Destination directory for this task
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Transfer rate cap in bytes per second
    #[serde(default)]
    pub rate_limit: Option<u64>,

    /// Retry attempts for transient engine failures
    #[serde(default)]
    pub retries: Option<u32>,

    /// HTTP proxy URL
    #[serde(default)]
    pub proxy: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_rate_limit(mut self, bytes_per_sec: u64) -> Self {
        self.rate_limit = Some(bytes_per_sec);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

fn default_retries() -> u32 {
    3
}

fn default_timeout() -> u64 {
    300 // 5 minutes
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Resolved engine configuration owned by a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Requested media format hint
    pub format: Option<String>,

    /// Destination directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Transfer rate cap in bytes per second (None = unlimited)
    pub rate_limit: Option<u64>,

    /// Retry attempts for transient engine failures
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// HTTP proxy URL
    pub proxy: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            format: None,
            output_dir: default_output_dir(),
            rate_limit: None,
            retries: default_retries(),
            proxy: None,
            timeout_seconds: default_timeout(),
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce an independently owned snapshot with the task's overrides
    /// applied on top of these defaults.
    pub fn merged(&self, overrides: &TaskOptions) -> Self {
        let mut out = self.clone();
        if let Some(v) = &overrides.format {
            out.format = Some(v.clone());
        }
        if let Some(v) = &overrides.output_dir {
            out.output_dir = v.clone();
        }
        if let Some(v) = overrides.rate_limit {
            out.rate_limit = Some(v);
        }
        if let Some(v) = overrides.retries {
            out.retries = v;
        }
        if let Some(v) = &overrides.proxy {
            out.proxy = Some(v.clone());
        }
        if let Some(v) = overrides.timeout_seconds {
            out.timeout_seconds = v;
        }
        out
    }

    /// Load defaults from environment variables.
    ///
    /// Supported variables:
    /// - DLMAN_OUTPUT_DIR: destination directory (default: ".")
    /// - DLMAN_RETRIES: retry attempts (default: 3)
    /// - DLMAN_TIMEOUT: per-request timeout in seconds (default: 300)
    /// - DLMAN_RATE_LIMIT: rate cap in bytes per second
    /// - DLMAN_PROXY: HTTP proxy URL
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(dir) = std::env::var("DLMAN_OUTPUT_DIR") {
            options.output_dir = PathBuf::from(dir);
        }
        if let Ok(retries) = std::env::var("DLMAN_RETRIES") {
            if let Ok(n) = retries.parse() {
                options.retries = n;
            }
        }
        if let Ok(timeout) = std::env::var("DLMAN_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                options.timeout_seconds = secs;
            }
        }
        if let Ok(limit) = std::env::var("DLMAN_RATE_LIMIT") {
            if let Ok(bps) = limit.parse() {
                options.rate_limit = Some(bps);
            }
        }
        if let Ok(proxy) = std::env::var("DLMAN_PROXY") {
            options.proxy = Some(proxy);
        }

        options
    }

    /// Load from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn default_flush_interval() -> u64 {
    500
}

/// Top-level manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Engine backend to use
    #[serde(default)]
    pub backend: EngineBackend,

    /// Process-wide default engine options
    #[serde(default)]
    pub defaults: EngineOptions,

    /// How often a running task flushes its progress to the store,
    /// in milliseconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::default(),
            defaults: EngineOptions::default(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self, defaults: EngineOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_flush_interval(mut self, millis: u64) -> Self {
        self.flush_interval_ms = millis;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = EngineOptions::default();
        assert_eq!(options.retries, 3);
        assert_eq!(options.timeout_seconds, 300);
        assert!(options.rate_limit.is_none());
    }

    #[test]
    fn test_merge_applies_only_set_fields() {
        let defaults = EngineOptions::default();
        let overrides = TaskOptions::new()
            .with_format("best")
            .with_retries(7);

        let merged = defaults.merged(&overrides);
        assert_eq!(merged.format.as_deref(), Some("best"));
        assert_eq!(merged.retries, 7);
        // untouched fields keep the defaults
        assert_eq!(merged.timeout_seconds, defaults.timeout_seconds);
        assert_eq!(merged.output_dir, defaults.output_dir);
    }

    #[test]
    fn test_merge_does_not_mutate_defaults() {
        let defaults = EngineOptions::default();
        let _ = defaults.merged(&TaskOptions::new().with_retries(9));
        assert_eq!(defaults.retries, 3);
    }

    #[test]
    fn test_json_roundtrip() {
        let options = EngineOptions {
            format: Some("audio".to_string()),
            ..EngineOptions::default()
        };
        let json = options.to_json().unwrap();
        let back = EngineOptions::from_json(&json).unwrap();
        assert_eq!(options, back);
    }

    #[test]
    fn test_task_options_builder() {
        let options = TaskOptions::new()
            .with_output_dir("/tmp/media")
            .with_rate_limit(1024)
            .with_timeout(60);
        assert_eq!(options.output_dir.as_deref(), Some(std::path::Path::new("/tmp/media")));
        assert_eq!(options.rate_limit, Some(1024));
        assert_eq!(options.timeout_seconds, Some(60));
    }
}
