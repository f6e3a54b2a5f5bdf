//! Document-level operations on the cache and the durable store.
//!
//! None of these take the document lock themselves. Callers go through the
//! `*_with_lock` wrappers on [`Synchronizer`](super::Synchronizer), which
//! also drain pending updates around the operation.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{SyncConfig, SyncError, SyncResult};
use crate::cache::{now_ms, DocumentCache};
use crate::document::{Document, Update};
use crate::history::{
    Entity, HistoryManager, HistoryMeta, RenameEntry, ResyncContent, ResyncDocContentEntry,
};
use crate::storage::{DocPersistence, PersistedDoc};

pub struct DocumentManager {
    cache: Arc<DocumentCache>,
    persistence: Arc<dyn DocPersistence>,
    history: Arc<HistoryManager>,
    config: SyncConfig,
}

impl DocumentManager {
    pub fn new(
        cache: Arc<DocumentCache>,
        persistence: Arc<dyn DocPersistence>,
        history: Arc<HistoryManager>,
        config: SyncConfig,
    ) -> Self {
        Self {
            cache,
            persistence,
            history,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn persistence(&self) -> &Arc<dyn DocPersistence> {
        &self.persistence
    }

    /// Return the cached document, loading it from durable storage on a
    /// miss. The flag reports whether it was already cached.
    pub async fn get_doc(&self, project_id: &str, doc_id: &str) -> SyncResult<(Document, bool)> {
        if let Some(doc) = self.cache.get_doc(project_id, doc_id)? {
            return Ok((doc, true));
        }

        debug!("Doc {} not in memory, loading from durable store", doc_id);
        let persisted = self.persistence.get_doc(project_id, doc_id).await?;
        let doc = from_persisted(project_id, doc_id, persisted)?;
        self.cache.put_doc_in_memory(&doc)?;
        Ok((doc, false))
    }

    /// The document plus the updates applied since `from_version`.
    pub async fn get_doc_and_recent_ops(
        &self,
        project_id: &str,
        doc_id: &str,
        from_version: Option<u64>,
    ) -> SyncResult<(Document, Vec<Update>)> {
        let (doc, _) = self.get_doc(project_id, doc_id).await?;
        let ops = match from_version {
            Some(from) => self.cache.get_previous_doc_ops(doc_id, from, None)?,
            None => Vec::new(),
        };
        Ok((doc, ops))
    }

    /// Persist the cached document if it has unflushed changes.
    ///
    /// Returns whether anything was written. Transient failures are retried
    /// with exponential backoff; once retries run out the document stays
    /// dirty and the error is returned.
    pub async fn flush_doc_if_loaded(&self, project_id: &str, doc_id: &str) -> SyncResult<bool> {
        let Some(doc) = self.cache.get_doc(project_id, doc_id)? else {
            debug!("Doc {} not loaded, nothing to flush", doc_id);
            return Ok(false);
        };
        if !doc.is_dirty() {
            debug!("Doc {} has no unflushed changes", doc_id);
            return Ok(false);
        }

        let record = to_persisted(&doc)?;
        let mut attempt = 0;
        loop {
            match self.persistence.set_doc(project_id, doc_id, &record).await {
                Ok(()) => {
                    self.cache.clear_unflushed_time(doc_id);
                    debug!("Flushed doc {} at v{}", doc_id, doc.version);
                    return Ok(true);
                }
                Err(e) => {
                    let err = SyncError::from(e);
                    if !err.is_transient() || attempt >= self.config.flush_max_retries {
                        warn!(
                            "Flush of doc {} failed after {} attempts, leaving it dirty: {}",
                            doc_id,
                            attempt + 1,
                            err
                        );
                        return Err(err);
                    }
                    let backoff = self.config.flush_retry_base * 2u32.saturating_pow(attempt);
                    debug!(
                        "Flush of doc {} failed ({}), retrying in {:?}",
                        doc_id, err, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Flush then drop the document from the cache.
    pub async fn flush_and_delete_doc(
        &self,
        project_id: &str,
        doc_id: &str,
        ignore_flush_errors: bool,
    ) -> SyncResult<()> {
        if let Err(e) = self.flush_doc_if_loaded(project_id, doc_id).await {
            if !ignore_flush_errors {
                return Err(e);
            }
            warn!("Ignoring flush error for doc {}: {}", doc_id, e);
        }

        self.history.flush_project_changes_async(project_id);
        self.cache.remove_doc_from_memory(project_id, doc_id)?;
        info!("Flushed and removed doc {} from memory", doc_id);
        Ok(())
    }

    /// Drop the document from both the cache and durable storage.
    pub async fn delete_doc(&self, project_id: &str, doc_id: &str) -> SyncResult<()> {
        self.cache.remove_doc_from_memory(project_id, doc_id)?;
        self.persistence.delete_doc(project_id, doc_id).await?;
        info!("Deleted doc {} of project {}", doc_id, project_id);
        Ok(())
    }

    /// Apply a rename to the cached pathname and record it in the history
    /// feed. Returns the history queue length.
    #[allow(clippy::too_many_arguments)]
    pub fn rename_doc(
        &self,
        project_id: &str,
        doc_id: &str,
        pathname: &str,
        new_pathname: &str,
        version: &str,
        user_id: Option<String>,
        project_history_id: Option<String>,
    ) -> SyncResult<usize> {
        if self.cache.set_pathname(doc_id, new_pathname) {
            debug!("Renamed cached doc {} to {}", doc_id, new_pathname);
        }
        let entry = RenameEntry {
            entity: Entity::Doc(doc_id.to_string()),
            pathname: pathname.to_string(),
            new_pathname: new_pathname.to_string(),
            version: version.to_string(),
            meta: HistoryMeta::new(user_id),
            project_history_id,
        };
        self.history.queue().push(project_id, &[entry])
    }

    /// Queue the full content of the document on the history feed so the
    /// history service can rebuild it. Reads the cached copy, or the durable
    /// record when the document is not loaded; a durable read does not load
    /// it. Returns the history queue length.
    pub async fn resync_doc_contents(&self, project_id: &str, doc_id: &str) -> SyncResult<usize> {
        let doc = match self.cache.get_doc(project_id, doc_id)? {
            Some(doc) => doc,
            None => {
                debug!("Resyncing doc {} from the durable store", doc_id);
                let persisted = self.persistence.get_doc(project_id, doc_id).await?;
                from_persisted(project_id, doc_id, persisted)?
            }
        };

        let entry = ResyncDocContentEntry {
            resync_doc_content: ResyncContent {
                content: doc.lines.join("\n"),
                version: doc.version,
            },
            project_history_id: doc.project_history_id.clone(),
            path: doc.pathname.clone(),
            doc: doc_id.to_string(),
            meta: HistoryMeta::new(None),
        };
        let len = self.history.queue().push(project_id, &[entry])?;
        self.history.flush_if_threshold_crossed(project_id, len, 1);
        info!("Queued content resync of doc {} at v{}", doc_id, doc.version);
        Ok(len)
    }

    /// Return the document, flushing first when its changes have been
    /// waiting longer than the configured age.
    pub async fn get_doc_and_flush_if_old(
        &self,
        project_id: &str,
        doc_id: &str,
    ) -> SyncResult<Document> {
        let (doc, already_loaded) = self.get_doc(project_id, doc_id).await?;
        if already_loaded && is_older_than(doc.unflushed_time, self.config.max_unflushed_age) {
            self.flush_doc_if_loaded(project_id, doc_id).await?;
        }
        Ok(doc)
    }
}

pub(crate) fn is_older_than(timestamp_ms: Option<i64>, age: Duration) -> bool {
    match timestamp_ms {
        Some(t) => now_ms() - t >= age.as_millis() as i64,
        None => false,
    }
}

fn to_persisted(doc: &Document) -> SyncResult<PersistedDoc> {
    let ranges = doc
        .ranges
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| SyncError::Internal(format!("ranges: {}", e)))?;
    Ok(PersistedDoc {
        project_id: doc.project_id.clone(),
        lines: doc.lines.clone(),
        version: doc.version,
        ranges,
        pathname: doc.pathname.clone(),
        project_history_id: doc.project_history_id.clone(),
        last_updated_at: doc.last_updated_at,
        last_updated_by: doc.last_updated_by.clone(),
    })
}

fn from_persisted(project_id: &str, doc_id: &str, persisted: PersistedDoc) -> SyncResult<Document> {
    let ranges = persisted
        .ranges
        .map(|json| serde_json::from_str::<Value>(&json))
        .transpose()
        .map_err(|e| SyncError::Corrupted(format!("stored ranges of {}: {}", doc_id, e)))?;
    let mut doc = Document::new(project_id, doc_id, persisted.lines, persisted.version)
        .with_pathname(persisted.pathname)
        .with_ranges(ranges)
        .with_project_history_id(persisted.project_history_id);
    doc.last_updated_at = persisted.last_updated_at;
    doc.last_updated_by = persisted.last_updated_by;
    Ok(doc)
}
