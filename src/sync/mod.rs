//! Document synchronization.
//!
//! This module turns concurrent client edits into one ordered version
//! history per document:
//! - [`DocumentManager`] loads, flushes, renames and removes cached documents
//! - [`Synchronizer`] applies updates under the per-document lock
//! - [`Dispatcher`] runs the worker pool that drains pending update queues
//! - [`FlushManager`] persists dirty documents and evicts idle ones
//! - [`ProjectCoordinator`] applies structural batches across a project

pub mod dispatch;
pub mod flush;
pub mod manager;
pub mod project;
pub mod updater;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use flush::{FlushConfig, FlushManager};
pub use manager::DocumentManager;
pub use project::{ProjectCoordinator, ProjectUpdate};
pub use updater::{AppliedOpsMessage, Synchronizer};

use std::time::Duration;
use thiserror::Error;

use crate::fast::FastStoreError;
use crate::lock::LockError;
use crate::ot::OtError;
use crate::storage::StorageError;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The update's base version is no longer current, or the requested
    /// op range has left the recent-ops window
    #[error("Stale update: {0}")]
    StaleUpdate(String),

    #[error("Content mismatch: {0}")]
    ContentMismatch(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Lock expired: {0}")]
    LockExpired(String),

    /// A submitted update was taken up by a worker but reported nothing in
    /// time; it may or may not have been applied
    #[error("Outcome unknown: {0}")]
    OutcomeUnknown(String),

    #[error("Durable store unavailable: {0}")]
    DurableStoreUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Document too large: {0}")]
    TooLarge(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Project state changed: {0}")]
    ProjectStateChanged(String),

    #[error("Too many pending updates: {0}")]
    Backpressure(String),

    #[error("Corrupted document: {0}")]
    Corrupted(String),

    #[error("Fast store error: {0}")]
    FastStore(#[from] FastStoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Transient failures that are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::LockTimeout(_) | SyncError::DurableStoreUnavailable(_)
        )
    }
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout(key) => SyncError::LockTimeout(key),
            LockError::Expired(key) => SyncError::LockExpired(key),
        }
    }
}

impl From<OtError> for SyncError {
    fn from(err: OtError) -> Self {
        match err {
            OtError::ContentMismatch { .. } => SyncError::ContentMismatch(err.to_string()),
            OtError::OutOfBounds { .. } => SyncError::InvalidUpdate(err.to_string()),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => SyncError::NotFound(id),
            StorageError::ProjectMismatch { doc_id, .. } => SyncError::NotFound(doc_id),
            other => SyncError::DurableStoreUnavailable(other.to_string()),
        }
    }
}

/// Tuning for the synchronizer and document manager
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Largest document accepted, as UTF-8 length of its joined text
    pub max_doc_length: usize,
    /// Pending updates applied per lock acquisition before re-checking
    pub max_ops_per_iteration: usize,
    /// Queue length multiple at which a project's history is flushed
    pub history_flush_threshold: usize,
    /// Documents unflushed for longer are flushed on read and on sweep
    pub max_unflushed_age: Duration,
    /// Attempts per flush before the document is left dirty
    pub flush_max_retries: u32,
    /// Backoff before the first flush retry, doubled on each attempt
    pub flush_retry_base: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_doc_length: 2 * 1024 * 1024, // 2MB
            max_ops_per_iteration: 8,
            history_flush_threshold: 500,
            max_unflushed_age: Duration::from_secs(300),
            flush_max_retries: 3,
            flush_retry_base: Duration::from_millis(100),
        }
    }
}

impl SyncConfig {
    pub fn with_max_doc_length(mut self, max: usize) -> Self {
        self.max_doc_length = max;
        self
    }

    pub fn with_history_flush_threshold(mut self, threshold: usize) -> Self {
        self.history_flush_threshold = threshold;
        self
    }

    pub fn with_max_unflushed_age(mut self, age: Duration) -> Self {
        self.max_unflushed_age = age;
        self
    }

    pub fn with_flush_retries(mut self, retries: u32, base: Duration) -> Self {
        self.flush_max_retries = retries;
        self.flush_retry_base = base;
        self
    }
}
