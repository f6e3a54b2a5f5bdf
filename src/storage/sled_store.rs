//! Sled-backed durable document store.
//!
//! One tree, `docs`, maps a document id to its bincode-encoded
//! [`PersistedDoc`]. The owning project is kept inside the record and
//! checked on every read.

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{DocPersistence, PersistedDoc, StorageConfig};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document {doc_id} belongs to project {actual}, not {requested}")]
    ProjectMismatch {
        doc_id: String,
        requested: String,
        actual: String,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_DOCS: &str = "docs";

/// Sled-based durable store
#[derive(Clone)]
pub struct SledDocStore {
    db: Arc<Db>,
    docs: Tree,
}

impl SledDocStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let docs = db.open_tree(TREE_DOCS)?;

        Ok(Self {
            db: Arc::new(db),
            docs,
        })
    }

    fn load(&self, doc_id: &str) -> StorageResult<Option<PersistedDoc>> {
        match self.docs.get(doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of durable documents
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    /// Force pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl DocPersistence for SledDocStore {
    async fn get_doc(&self, project_id: &str, doc_id: &str) -> StorageResult<PersistedDoc> {
        let doc = self
            .load(doc_id)?
            .ok_or_else(|| StorageError::NotFound(doc_id.to_string()))?;
        if doc.project_id != project_id {
            return Err(StorageError::ProjectMismatch {
                doc_id: doc_id.to_string(),
                requested: project_id.to_string(),
                actual: doc.project_id,
            });
        }
        Ok(doc)
    }

    async fn set_doc(
        &self,
        project_id: &str,
        doc_id: &str,
        doc: &PersistedDoc,
    ) -> StorageResult<()> {
        if let Some(existing) = self.load(doc_id)? {
            if existing.project_id != project_id {
                return Err(StorageError::ProjectMismatch {
                    doc_id: doc_id.to_string(),
                    requested: project_id.to_string(),
                    actual: existing.project_id,
                });
            }
        }
        let bytes = bincode::serialize(doc)?;
        self.docs.insert(doc_id.as_bytes(), bytes)?;
        Ok(())
    }

    async fn delete_doc(&self, project_id: &str, doc_id: &str) -> StorageResult<()> {
        match self.load(doc_id)? {
            Some(existing) if existing.project_id != project_id => {
                Err(StorageError::ProjectMismatch {
                    doc_id: doc_id.to_string(),
                    requested: project_id.to_string(),
                    actual: existing.project_id,
                })
            }
            _ => {
                self.docs.remove(doc_id.as_bytes())?;
                Ok(())
            }
        }
    }

    async fn ping(&self) -> StorageResult<()> {
        self.docs.contains_key(b"__ping__")?;
        Ok(())
    }
}

impl Drop for SledDocStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
