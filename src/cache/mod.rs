//! Document cache on the fast store.
//!
//! Each field of a cached document lives under its own key. Every key of a
//! document carries the `{doc_id}` tag so they shard together:
//!
//! | key                         | value                                   |
//! |-----------------------------|-----------------------------------------|
//! | `doclines:{d}`              | JSON array of lines                     |
//! | `DocVersion:{d}`            | version                                 |
//! | `DocHash:{d}`               | content hash                            |
//! | `ProjectId:{d}`             | owning project                          |
//! | `Ranges:{d}`                | JSON ranges, absent when empty          |
//! | `Pathname:{d}`              | path within the project                 |
//! | `ProjectHistoryId:{d}`      | history service project id              |
//! | `UnflushedTime:{d}`         | ms timestamp of first unflushed change  |
//! | `lastUpdatedAt:{d}`         | ms timestamp of last applied update     |
//! | `lastUpdatedBy:{d}`         | user id of last applied update          |
//! | `lastAccessedAt:{d}`        | ms timestamp of last read or write      |
//! | `DocOps:{d}`                | recent applied updates                  |
//!
//! Project-level keys: `DocsIn:{p}` (set of cached doc ids),
//! `ProjectState:{p}` and the deferred deletion queue.
//!
//! The cache never loads from durable storage itself; a miss is reported
//! to the caller.

use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::document::{normalize_ranges, Document, Update};
use crate::fast::FastStore;
use crate::ot;
use crate::sync::{SyncError, SyncResult};

/// Applied updates kept per document for clients catching up
pub const DOC_OPS_MAX_LENGTH: usize = 100;
const DOC_OPS_TTL: Duration = Duration::from_secs(60 * 60);
const PROJECT_STATE_TTL: Duration = Duration::from_secs(30 * 60);
const MAX_RANGES_SIZE: usize = 3 * 1024 * 1024;
const FLUSH_AND_DELETE_QUEUE: &str = "DocUpdaterFlushAndDeleteQueue";
/// Spread queued deletions over this many ms so they are not all due at once
const QUEUE_SMOOTHING_MS: u64 = 10_000;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn doc_key(field: &str, doc_id: &str) -> String {
    format!("{}:{{{}}}", field, doc_id)
}

struct DocKeys {
    lines: String,
    version: String,
    hash: String,
    project: String,
    ranges: String,
    pathname: String,
    history_id: String,
    unflushed: String,
    updated_at: String,
    updated_by: String,
    accessed_at: String,
    ops: String,
}

impl DocKeys {
    fn new(doc_id: &str) -> Self {
        Self {
            lines: doc_key("doclines", doc_id),
            version: doc_key("DocVersion", doc_id),
            hash: doc_key("DocHash", doc_id),
            project: doc_key("ProjectId", doc_id),
            ranges: doc_key("Ranges", doc_id),
            pathname: doc_key("Pathname", doc_id),
            history_id: doc_key("ProjectHistoryId", doc_id),
            unflushed: doc_key("UnflushedTime", doc_id),
            updated_at: doc_key("lastUpdatedAt", doc_id),
            updated_by: doc_key("lastUpdatedBy", doc_id),
            accessed_at: doc_key("lastAccessedAt", doc_id),
            ops: doc_key("DocOps", doc_id),
        }
    }

    fn all(&self) -> Vec<String> {
        vec![
            self.lines.clone(),
            self.version.clone(),
            self.hash.clone(),
            self.project.clone(),
            self.ranges.clone(),
            self.pathname.clone(),
            self.history_id.clone(),
            self.unflushed.clone(),
            self.updated_at.clone(),
            self.updated_by.clone(),
            self.accessed_at.clone(),
            self.ops.clone(),
        ]
    }
}

fn docs_in_project_key(project_id: &str) -> String {
    format!("DocsIn:{{{}}}", project_id)
}

fn project_state_key(project_id: &str) -> String {
    format!("ProjectState:{{{}}}", project_id)
}

fn parse_i64(field: &str, value: Option<String>) -> SyncResult<Option<i64>> {
    value
        .map(|v| {
            v.parse()
                .map_err(|_| SyncError::Corrupted(format!("{} is not a number: {}", field, v)))
        })
        .transpose()
}

fn serialize_ranges(ranges: &Option<Value>) -> SyncResult<Option<String>> {
    match ranges {
        None => Ok(None),
        Some(value) => {
            let json = serde_json::to_string(value)
                .map_err(|e| SyncError::InvalidUpdate(format!("ranges: {}", e)))?;
            if json.len() > MAX_RANGES_SIZE {
                return Err(SyncError::TooLarge(format!(
                    "ranges are {} bytes",
                    json.len()
                )));
            }
            Ok(Some(json))
        }
    }
}

/// Hot document state shared by all workers
pub struct DocumentCache {
    store: Arc<FastStore>,
    max_doc_length: usize,
}

impl DocumentCache {
    pub fn new(store: Arc<FastStore>, max_doc_length: usize) -> Self {
        Self {
            store,
            max_doc_length,
        }
    }

    fn check_lines(&self, doc_id: &str, lines: &[String]) -> SyncResult<()> {
        if lines.iter().any(|line| line.contains('\0')) {
            error!("Null bytes found in lines of doc {}", doc_id);
            return Err(SyncError::Corrupted(format!(
                "null bytes found in doc lines of {}",
                doc_id
            )));
        }
        let len = ot::joined_len(lines);
        if len > self.max_doc_length {
            warn!("Doc {} is too large ({} bytes)", doc_id, len);
            return Err(SyncError::TooLarge(format!(
                "doc {} is {} bytes, limit {}",
                doc_id, len, self.max_doc_length
            )));
        }
        Ok(())
    }

    fn encode_lines(lines: &[String]) -> SyncResult<String> {
        serde_json::to_string(lines).map_err(|e| SyncError::Internal(e.to_string()))
    }

    /// Write a whole document into the cache.
    pub fn put_doc_in_memory(&self, doc: &Document) -> SyncResult<()> {
        self.check_lines(&doc.doc_id, &doc.lines)?;
        let keys = DocKeys::new(&doc.doc_id);
        let ranges = serialize_ranges(&normalize_ranges(doc.ranges.clone()))?;

        let mut pairs = vec![
            (keys.lines.clone(), Self::encode_lines(&doc.lines)?),
            (keys.version.clone(), doc.version.to_string()),
            (keys.hash.clone(), ot::compute_hash(&doc.lines)),
            (keys.project.clone(), doc.project_id.clone()),
            (keys.pathname.clone(), doc.pathname.clone()),
            (keys.accessed_at.clone(), now_ms().to_string()),
        ];
        let mut absent = Vec::new();
        match ranges {
            Some(json) => pairs.push((keys.ranges.clone(), json)),
            None => absent.push(keys.ranges.clone()),
        }
        match &doc.project_history_id {
            Some(id) => pairs.push((keys.history_id.clone(), id.clone())),
            None => absent.push(keys.history_id.clone()),
        }
        for (key, value) in [
            (&keys.unflushed, doc.unflushed_time.map(|t| t.to_string())),
            (&keys.updated_at, doc.last_updated_at.map(|t| t.to_string())),
            (&keys.updated_by, doc.last_updated_by.clone()),
        ] {
            match value {
                Some(value) => pairs.push((key.clone(), value)),
                None => absent.push(key.clone()),
            }
        }

        self.store.del(&absent);
        self.store.mset(pairs);
        self.store
            .sadd(&docs_in_project_key(&doc.project_id), doc.doc_id.clone())?;
        debug!("Put doc {} v{} in memory", doc.doc_id, doc.version);
        Ok(())
    }

    /// Read a cached document. `Ok(None)` is a cache miss.
    pub fn get_doc(&self, project_id: &str, doc_id: &str) -> SyncResult<Option<Document>> {
        let keys = DocKeys::new(doc_id);
        let values = self.store.mget(&[
            keys.lines.clone(),
            keys.version.clone(),
            keys.hash.clone(),
            keys.project.clone(),
            keys.ranges.clone(),
            keys.pathname.clone(),
            keys.history_id.clone(),
            keys.unflushed.clone(),
            keys.updated_at.clone(),
            keys.updated_by.clone(),
        ])?;
        let mut values = values.into_iter();
        let mut next = || values.next().flatten();
        let (lines, version, hash, stored_project) = (next(), next(), next(), next());
        let (ranges, pathname, history_id) = (next(), next(), next());
        let (unflushed, updated_at, updated_by) = (next(), next(), next());

        let (Some(lines), Some(version)) = (lines, version) else {
            return Ok(None);
        };

        if let Some(stored) = &stored_project {
            if stored != project_id {
                warn!(
                    "Doc {} requested for project {} but cached under {}",
                    doc_id, project_id, stored
                );
                return Err(SyncError::NotFound(format!(
                    "doc {} not in project {}",
                    doc_id, project_id
                )));
            }
        }

        let lines: Vec<String> = serde_json::from_str(&lines)
            .map_err(|e| SyncError::Corrupted(format!("lines of {}: {}", doc_id, e)))?;
        let version: u64 = version
            .parse()
            .map_err(|_| SyncError::Corrupted(format!("version of {}: {}", doc_id, version)))?;

        // a mismatch is reported but the cached lines still win
        let computed = ot::compute_hash(&lines);
        if hash.as_deref() != Some(computed.as_str()) {
            error!(
                "Hash mismatch for doc {}: stored {:?}, computed {}",
                doc_id, hash, computed
            );
        }

        let ranges = ranges
            .map(|json| serde_json::from_str::<Value>(&json))
            .transpose()
            .map_err(|e| SyncError::Corrupted(format!("ranges of {}: {}", doc_id, e)))?;

        self.touch(doc_id);

        Ok(Some(Document {
            project_id: project_id.to_string(),
            doc_id: doc_id.to_string(),
            lines,
            version,
            hash: computed,
            ranges: normalize_ranges(ranges),
            pathname: pathname.unwrap_or_default(),
            project_history_id: history_id,
            unflushed_time: parse_i64("unflushed time", unflushed)?,
            last_updated_at: parse_i64("last updated at", updated_at)?,
            last_updated_by: updated_by,
        }))
    }

    pub fn get_doc_version(&self, doc_id: &str) -> SyncResult<Option<u64>> {
        let version = self.store.get(&doc_key("DocVersion", doc_id))?;
        version
            .map(|v| {
                v.parse()
                    .map_err(|_| SyncError::Corrupted(format!("version of {}: {}", doc_id, v)))
            })
            .transpose()
    }

    pub fn is_loaded(&self, doc_id: &str) -> bool {
        self.store.exists(&doc_key("DocVersion", doc_id))
    }

    /// Store the result of applying `applied` to the cached document.
    ///
    /// `new_version` must equal the cached version plus the number of applied
    /// updates; anything else means the cache moved underneath the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn update_document(
        &self,
        project_id: &str,
        doc_id: &str,
        lines: &[String],
        new_version: u64,
        applied: &[Update],
        ranges: Option<Value>,
        updated_by: Option<&str>,
    ) -> SyncResult<()> {
        let keys = DocKeys::new(doc_id);
        let current = self
            .get_doc_version(doc_id)?
            .ok_or_else(|| SyncError::NotFound(format!("doc {} not loaded", doc_id)))?;

        if current + applied.len() as u64 != new_version {
            error!(
                "Version mismatch for doc {}: {} + {} != {}",
                doc_id,
                current,
                applied.len(),
                new_version
            );
            return Err(SyncError::Corrupted(format!(
                "version mismatch in update_document for {}: {} + {} != {}",
                doc_id,
                current,
                applied.len(),
                new_version
            )));
        }

        self.check_lines(doc_id, lines)?;
        let ranges = serialize_ranges(&normalize_ranges(ranges))?;
        let now = now_ms();

        let mut pairs = vec![
            (keys.lines.clone(), Self::encode_lines(lines)?),
            (keys.version.clone(), new_version.to_string()),
            (keys.hash.clone(), ot::compute_hash(lines)),
            (keys.updated_at.clone(), now.to_string()),
            (keys.accessed_at.clone(), now.to_string()),
        ];
        match ranges {
            Some(json) => pairs.push((keys.ranges.clone(), json)),
            None => {
                self.store.del(&[keys.ranges.clone()]);
            }
        }
        match updated_by {
            Some(user) => pairs.push((keys.updated_by.clone(), user.to_string())),
            None => {
                self.store.del(&[keys.updated_by.clone()]);
            }
        }
        self.store.mset(pairs);

        if !applied.is_empty() {
            let encoded = applied
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SyncError::Internal(e.to_string()))?;
            self.store.rpush(&keys.ops, encoded)?;
            self.store.ltrim_last(&keys.ops, DOC_OPS_MAX_LENGTH)?;
            self.store.expire(&keys.ops, DOC_OPS_TTL);
        }

        self.store.set_nx(&keys.unflushed, now.to_string());
        self.store
            .sadd(&docs_in_project_key(project_id), doc_id.to_string())?;
        Ok(())
    }

    /// Recent updates with versions in `start..end` (`end` defaults to the
    /// current version).
    pub fn get_previous_doc_ops(
        &self,
        doc_id: &str,
        start: u64,
        end: Option<u64>,
    ) -> SyncResult<Vec<Update>> {
        let keys = DocKeys::new(doc_id);
        let version = self
            .get_doc_version(doc_id)?
            .ok_or_else(|| SyncError::NotFound(format!("doc {} not loaded", doc_id)))?;
        let length = self.store.llen(&keys.ops)? as u64;
        let first_version = version.saturating_sub(length);
        let end = end.unwrap_or(version);

        if start < first_version || end > version || start > end {
            warn!(
                "Op range {}..{} of doc {} not available (have {}..{})",
                start, end, doc_id, first_version, version
            );
            return Err(SyncError::StaleUpdate(format!(
                "doc ops range {}..{} is not loaded for {}",
                start, end, doc_id
            )));
        }
        if start == end {
            return Ok(Vec::new());
        }

        let from = (start - first_version) as i64;
        let to = (end - first_version) as i64 - 1;
        self.store
            .lrange(&keys.ops, from, to)?
            .iter()
            .map(|json| {
                serde_json::from_str(json)
                    .map_err(|e| SyncError::Corrupted(format!("doc op of {}: {}", doc_id, e)))
            })
            .collect()
    }

    /// Mark the document as diverged from durable storage, keeping the
    /// earliest timestamp.
    pub fn mark_dirty(&self, doc_id: &str) {
        self.store
            .set_nx(&doc_key("UnflushedTime", doc_id), now_ms().to_string());
    }

    pub fn clear_unflushed_time(&self, doc_id: &str) {
        self.store.del(&[doc_key("UnflushedTime", doc_id)]);
    }

    pub fn unflushed_time(&self, doc_id: &str) -> SyncResult<Option<i64>> {
        Ok(self.store.get_i64(&doc_key("UnflushedTime", doc_id))?)
    }

    fn touch(&self, doc_id: &str) {
        self.store
            .set(&doc_key("lastAccessedAt", doc_id), now_ms().to_string());
    }

    pub fn last_accessed(&self, doc_id: &str) -> SyncResult<Option<i64>> {
        Ok(self.store.get_i64(&doc_key("lastAccessedAt", doc_id))?)
    }

    /// Update the pathname of a cached document. Returns whether it is cached.
    pub fn set_pathname(&self, doc_id: &str, pathname: &str) -> bool {
        if !self.is_loaded(doc_id) {
            return false;
        }
        self.store.set(&doc_key("Pathname", doc_id), pathname);
        true
    }

    pub fn remove_doc_from_memory(&self, project_id: &str, doc_id: &str) -> SyncResult<()> {
        let keys = DocKeys::new(doc_id);
        self.store.del(&keys.all());
        self.store.srem(&docs_in_project_key(project_id), doc_id)?;
        self.store.del(&[project_state_key(project_id)]);
        debug!("Removed doc {} from memory", doc_id);
        Ok(())
    }

    pub fn doc_ids_in_project(&self, project_id: &str) -> SyncResult<Vec<String>> {
        Ok(self.store.smembers(&docs_in_project_key(project_id))?)
    }

    /// Projects with at least one cached document
    pub fn project_ids(&self) -> Vec<String> {
        self.store
            .keys_with_prefix("DocsIn:")
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix("DocsIn:{")
                    .and_then(|rest| rest.strip_suffix('}'))
                    .map(str::to_string)
            })
            .collect()
    }

    /// Every cached `(project_id, doc_id)` pair
    pub fn loaded_docs(&self) -> SyncResult<Vec<(String, String)>> {
        let mut docs = Vec::new();
        for project_id in self.project_ids() {
            for doc_id in self.doc_ids_in_project(&project_id)? {
                docs.push((project_id.clone(), doc_id));
            }
        }
        Ok(docs)
    }

    /// Count of cached documents
    pub fn total_docs(&self) -> usize {
        self.store.keys_with_prefix("DocVersion:").len()
    }

    /// Record the caller's view of the project and report whether it
    /// differs from the previous one.
    pub fn check_or_set_project_state(&self, project_id: &str, state: &str) -> SyncResult<bool> {
        let key = project_state_key(project_id);
        let previous = self.store.getset(&key, state)?;
        self.store.expire(&key, PROJECT_STATE_TTL);
        debug!(
            "Checking project {} state: old {:?}, new {}",
            project_id, previous, state
        );
        Ok(previous.as_deref() != Some(state))
    }

    pub fn clear_project_state(&self, project_id: &str) {
        self.store.del(&[project_state_key(project_id)]);
    }

    /// Schedule a project for background flush-and-delete.
    pub fn queue_flush_and_delete_project(&self, project_id: &str) -> SyncResult<()> {
        let smoothing = rand::thread_rng().gen_range(0..QUEUE_SMOOTHING_MS) as i64;
        let score = (now_ms() + smoothing) as f64;
        self.store
            .zadd(FLUSH_AND_DELETE_QUEUE, score, project_id.to_string())?;
        Ok(())
    }

    /// Pop the oldest queued project scheduled at or before `cutoff_ms`.
    /// Returns the project, its scheduled time and how many remain queued.
    pub fn next_project_to_flush_and_delete(
        &self,
        cutoff_ms: i64,
    ) -> SyncResult<Option<(String, i64, usize)>> {
        match self
            .store
            .zpop_min_upto(FLUSH_AND_DELETE_QUEUE, cutoff_ms as f64)?
        {
            Some((project_id, score)) => {
                let remaining = self.store.zcard(FLUSH_AND_DELETE_QUEUE)?;
                Ok(Some((project_id, score as i64, remaining)))
            }
            None => Ok(None),
        }
    }

    pub fn queued_projects(&self) -> SyncResult<usize> {
        Ok(self.store.zcard(FLUSH_AND_DELETE_QUEUE)?)
    }
}
