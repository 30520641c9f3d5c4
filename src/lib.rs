//! dlman: download task lifecycle management
//!
//! Tasks are identified by the SHA-256 of their source URL, persisted as
//! durable records, and driven by a pluggable download engine. The
//! `TaskManager` keeps the active/inactive partition: at most one in-memory
//! task per identifier, with pause/resume, halt, and write-through
//! persistence of every lifecycle transition.

pub mod config;
pub mod engine;
pub mod error;
pub mod ident;
pub mod manager;
pub mod state;
pub mod store;
pub mod task;

use std::sync::Arc;

pub use config::{EngineBackend, EngineOptions, ManagerConfig, TaskOptions};
pub use engine::{DownloadEngine, FetchOutcome, HttpEngine, MediaProbe, ProgressFn};
pub use error::{ErrorKind, Result, TaskError};
pub use ident::{TaskId, TASK_ID_LEN};
pub use manager::TaskManager;
pub use state::{TaskInfo, TaskState, TaskStatus};
pub use store::{FileStore, TaskRecord, TaskStore};
pub use task::Task;

/// Construct the engine for a configured backend.
pub fn create_engine(backend: EngineBackend) -> Arc<dyn DownloadEngine> {
    match backend {
        EngineBackend::Http => Arc::new(HttpEngine::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_engine_http() {
        let engine = create_engine(EngineBackend::Http);
        assert_eq!(engine.name(), "http");
    }
}
