//! Durable document storage.
//!
//! The durable store is the source of truth for documents that are not
//! cached. Only the flush path writes to it; the synchronizer never does.
//! Records are keyed by document id and indexed by project.

mod sled_store;

pub use sled_store::{SledDocStore, StorageError, StorageResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A document as written to durable storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDoc {
    pub project_id: String,
    pub lines: Vec<String>,
    pub version: u64,
    /// Ranges as JSON text; absent when empty
    pub ranges: Option<String>,
    pub pathname: String,
    pub project_history_id: Option<String>,
    pub last_updated_at: Option<i64>,
    pub last_updated_by: Option<String>,
}

impl PersistedDoc {
    pub fn new(project_id: impl Into<String>, lines: Vec<String>, version: u64) -> Self {
        Self {
            project_id: project_id.into(),
            lines,
            version,
            ranges: None,
            pathname: String::new(),
            project_history_id: None,
            last_updated_at: None,
            last_updated_by: None,
        }
    }

    pub fn with_pathname(mut self, pathname: impl Into<String>) -> Self {
        self.pathname = pathname.into();
        self
    }
}

/// Durable store seam. Implemented by [`SledDocStore`]; tests substitute
/// failing stores.
#[async_trait]
pub trait DocPersistence: Send + Sync {
    async fn get_doc(&self, project_id: &str, doc_id: &str) -> StorageResult<PersistedDoc>;

    async fn set_doc(&self, project_id: &str, doc_id: &str, doc: &PersistedDoc)
        -> StorageResult<()>;

    async fn delete_doc(&self, project_id: &str, doc_id: &str) -> StorageResult<()>;

    async fn ping(&self) -> StorageResult<()>;
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/docsync.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}
