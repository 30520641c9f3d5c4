//! Identifier derivation for download tasks
//!
//! Task identifiers are content-addressed: the SHA-256 digest of the source
//! URL, hex-encoded. Re-submitting the same URL always maps to the same
//! record, and distinct URLs cannot collide in practice.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TaskError};

/// Length of a task identifier in hex characters (SHA-256)
pub const TASK_ID_LEN: usize = 64;

/// Stable, opaque identifier for a download task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Derive the identifier for a source URL.
    ///
    /// Pure and deterministic: byte-identical URLs always yield the same
    /// identifier.
    pub fn derive(url: &str) -> Self {
        Self(hex::encode(Sha256::digest(url.as_bytes())))
    }

    /// Validate a raw identifier string received from a caller.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() != TASK_ID_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TaskError::invalid_input(format!(
                "malformed task identifier: {:?}",
                raw
            )));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used in file names and log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_derive_is_deterministic() {
        let a = TaskId::derive("https://example.com/video");
        let b = TaskId::derive("https://example.com/video");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), TASK_ID_LEN);
    }

    #[test]
    fn test_distinct_urls_yield_distinct_ids() {
        let mut seen = HashSet::new();
        for i in 0..1000 {
            let id = TaskId::derive(&format!("https://example.com/video?v={}", i));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = TaskId::derive("https://example.com/a");
        let parsed = TaskId::parse(id.as_str()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(TaskId::parse("nonexistent-id").is_err());
        assert!(TaskId::parse("").is_err());
        assert!(TaskId::parse(&"z".repeat(TASK_ID_LEN)).is_err());
    }

    #[test]
    fn test_short_prefix() {
        let id = TaskId::derive("https://example.com/a");
        assert_eq!(id.short(), &id.as_str()[..12]);
    }
}
