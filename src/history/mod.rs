//! Outbound change feed for the downstream history service.
//!
//! Applied updates and structural changes are appended, in order, to a
//! per-project queue in the fast store. Once a queue crosses a multiple of
//! the flush threshold its contents are shipped to the history service in
//! the background. Delivery is at-least-once; the receiver is expected to
//! ignore duplicate ordered entries.
//!
//! Flushes of one project are serialized by a lock, and a flush only
//! removes the exact entries it delivered, so entries queued while a
//! delivery is in flight stay queued for the next one.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::now_ms;
use crate::fast::FastStore;
use crate::lock::{project_history_lock_key, LockManager};
use crate::ot::Op;
use crate::sync::{SyncError, SyncResult};

/// Errors talking to the history service
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("History service unavailable: {0}")]
    Unavailable(String),
}

fn ops_key(project_id: &str) -> String {
    format!("ProjectHistory:Ops:{{{}}}", project_id)
}

fn first_op_timestamp_key(project_id: &str) -> String {
    format!("ProjectHistory:FirstOpTimestamp:{{{}}}", project_id)
}

/// True when growing a queue by `added` entries to `new_len` crosses a
/// multiple of `threshold`.
pub fn should_flush(new_len: usize, added: usize, threshold: usize) -> bool {
    if new_len == 0 || threshold == 0 {
        return false;
    }
    let previous = new_len.saturating_sub(added);
    previous / threshold != new_len / threshold
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryMeta {
    pub user_id: Option<String>,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_length: Option<usize>,
}

impl HistoryMeta {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id,
            ts: now_ms(),
            pathname: None,
            doc_length: None,
        }
    }
}

/// An applied document update
#[derive(Debug, Clone, Serialize)]
pub struct DocUpdateEntry {
    pub doc: String,
    pub op: Vec<Op>,
    /// Base version the update was applied against
    pub v: u64,
    /// Version after applying
    pub version: u64,
    pub meta: HistoryMeta,
    #[serde(rename = "projectHistoryId", skip_serializing_if = "Option::is_none")]
    pub project_history_id: Option<String>,
}

/// Which kind of project entity a structural entry refers to
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Doc(String),
    File(String),
}

/// A rename; an empty `new_pathname` records a removal
#[derive(Debug, Clone, Serialize)]
pub struct RenameEntry {
    #[serde(flatten)]
    pub entity: Entity,
    pub pathname: String,
    pub new_pathname: String,
    pub version: String,
    pub meta: HistoryMeta,
    #[serde(rename = "projectHistoryId", skip_serializing_if = "Option::is_none")]
    pub project_history_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddEntry {
    #[serde(flatten)]
    pub entity: Entity,
    pub pathname: String,
    #[serde(rename = "docLines", skip_serializing_if = "Option::is_none")]
    pub doc_lines: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub version: String,
    pub meta: HistoryMeta,
    #[serde(rename = "projectHistoryId", skip_serializing_if = "Option::is_none")]
    pub project_history_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResyncContent {
    pub content: String,
    pub version: u64,
}

/// Full content of a doc, queued so the history service can resync it
#[derive(Debug, Clone, Serialize)]
pub struct ResyncDocContentEntry {
    #[serde(rename = "resyncDocContent")]
    pub resync_doc_content: ResyncContent,
    #[serde(rename = "projectHistoryId", skip_serializing_if = "Option::is_none")]
    pub project_history_id: Option<String>,
    pub path: String,
    pub doc: String,
    pub meta: HistoryMeta,
}

/// Per-project ordered queue of history entries
pub struct HistoryQueue {
    store: Arc<FastStore>,
}

impl HistoryQueue {
    pub fn new(store: Arc<FastStore>) -> Self {
        Self { store }
    }

    /// Append entries and return the queue length afterwards.
    pub fn push<T: Serialize>(&self, project_id: &str, entries: &[T]) -> SyncResult<usize> {
        let encoded = entries
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SyncError::Internal(format!("history entry: {}", e)))?;
        let len = self.store.rpush(&ops_key(project_id), encoded)?;
        self.store
            .set_nx(&first_op_timestamp_key(project_id), now_ms().to_string());
        Ok(len)
    }

    pub fn len(&self, project_id: &str) -> SyncResult<usize> {
        Ok(self.store.llen(&ops_key(project_id))?)
    }

    /// Entries waiting for delivery, oldest first
    pub fn pending(&self, project_id: &str) -> SyncResult<Vec<Value>> {
        decode(&self.pending_encoded(project_id)?)
    }

    fn pending_encoded(&self, project_id: &str) -> SyncResult<Vec<String>> {
        Ok(self.store.lrange(&ops_key(project_id), 0, -1)?)
    }

    /// Drop delivered entries from the head of the queue. Only a head that
    /// still matches `delivered` is removed; returns how many entries went.
    pub fn acknowledge(&self, project_id: &str, delivered: &[String]) -> SyncResult<usize> {
        let removed = self.store.lpop_prefix(&ops_key(project_id), delivered)?;
        if self.len(project_id)? == 0 {
            self.store.del(&[first_op_timestamp_key(project_id)]);
        }
        Ok(removed)
    }

    /// When the oldest undelivered entry was queued
    pub fn first_op_timestamp(&self, project_id: &str) -> SyncResult<Option<i64>> {
        Ok(self.store.get_i64(&first_op_timestamp_key(project_id))?)
    }
}

fn decode(encoded: &[String]) -> SyncResult<Vec<Value>> {
    encoded
        .iter()
        .map(|json| {
            serde_json::from_str(json)
                .map_err(|e| SyncError::Corrupted(format!("history entry: {}", e)))
        })
        .collect()
}

/// Receiver of flushed history entries
#[async_trait]
pub trait HistoryClient: Send + Sync {
    async fn send(&self, project_id: &str, entries: &[Value]) -> Result<(), HistoryError>;
}

/// Posts entries to `{base_url}/project/{project_id}/flush`.
pub struct HttpHistoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl HistoryClient for HttpHistoryClient {
    async fn send(&self, project_id: &str, entries: &[Value]) -> Result<(), HistoryError> {
        let url = format!("{}/project/{}/flush", self.base_url, project_id);
        self.client
            .post(&url)
            .json(&serde_json::json!({ "updates": entries }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Discards entries; used when no history service is configured.
pub struct NoopHistoryClient;

#[async_trait]
impl HistoryClient for NoopHistoryClient {
    async fn send(&self, project_id: &str, entries: &[Value]) -> Result<(), HistoryError> {
        debug!(
            "Dropping {} history entries for project {}",
            entries.len(),
            project_id
        );
        Ok(())
    }
}

/// Keeps delivered entries in memory; can be told to fail.
#[derive(Default)]
pub struct MemoryHistoryClient {
    sent: Mutex<Vec<(String, Vec<Value>)>>,
    failing: AtomicBool,
}

impl MemoryHistoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries_for(&self, project_id: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(p, _)| p == project_id)
            .flat_map(|(_, entries)| entries.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl HistoryClient for MemoryHistoryClient {
    async fn send(&self, project_id: &str, entries: &[Value]) -> Result<(), HistoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HistoryError::Unavailable("configured to fail".into()));
        }
        self.sent
            .lock()
            .push((project_id.to_string(), entries.to_vec()));
        Ok(())
    }
}

/// Queue plus delivery policy
pub struct HistoryManager {
    queue: HistoryQueue,
    locks: Arc<LockManager>,
    client: Arc<dyn HistoryClient>,
    threshold: usize,
}

impl HistoryManager {
    pub fn new(
        store: Arc<FastStore>,
        locks: Arc<LockManager>,
        client: Arc<dyn HistoryClient>,
        threshold: usize,
    ) -> Self {
        Self {
            queue: HistoryQueue::new(store),
            locks,
            client,
            threshold,
        }
    }

    pub fn queue(&self) -> &HistoryQueue {
        &self.queue
    }

    pub fn should_flush(&self, new_len: usize, added: usize) -> bool {
        should_flush(new_len, added, self.threshold)
    }

    /// Deliver everything queued for the project. Returns the number of
    /// entries sent.
    pub async fn flush_project_changes(&self, project_id: &str) -> SyncResult<usize> {
        self.locks
            .run_with_lock(&project_history_lock_key(project_id), || {
                self.deliver(project_id)
            })
            .await
    }

    async fn deliver(&self, project_id: &str) -> SyncResult<usize> {
        let encoded = self.queue.pending_encoded(project_id)?;
        if encoded.is_empty() {
            return Ok(0);
        }
        let entries = decode(&encoded)?;
        self.client
            .send(project_id, &entries)
            .await
            .map_err(|e| SyncError::Internal(format!("history flush for {}: {}", project_id, e)))?;

        let removed = self.queue.acknowledge(project_id, &encoded)?;
        if removed != encoded.len() {
            warn!(
                "History queue of {} changed during delivery: sent {}, acknowledged {}",
                project_id,
                encoded.len(),
                removed
            );
        }
        info!(
            "Flushed {} history entries for project {}",
            entries.len(),
            project_id
        );
        Ok(entries.len())
    }

    /// Flush in a background task; failures are only logged.
    pub fn flush_project_changes_async(self: &Arc<Self>, project_id: &str) {
        let history = Arc::clone(self);
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = history.flush_project_changes(&project_id).await {
                error!("Background history flush for {} failed: {}", project_id, e);
            }
        });
    }

    /// Flush in the background when the queue just crossed the threshold.
    pub fn flush_if_threshold_crossed(self: &Arc<Self>, project_id: &str, new_len: usize, added: usize) {
        if self.should_flush(new_len, added) {
            debug!(
                "History queue for {} reached {} entries, flushing",
                project_id, new_len
            );
            self.flush_project_changes_async(project_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockConfig;
    use serde_json::json;
    use std::time::Duration;

    fn history_with_client(client: Arc<dyn HistoryClient>, threshold: usize) -> Arc<HistoryManager> {
        let store = Arc::new(FastStore::new());
        let locks = Arc::new(LockManager::new(
            store.clone(),
            LockConfig::default()
                .with_max_wait(Duration::from_secs(2))
                .with_poll_interval(Duration::from_millis(5)),
        ));
        Arc::new(HistoryManager::new(store, locks, client, threshold))
    }

    fn test_history(threshold: usize) -> (Arc<HistoryManager>, Arc<MemoryHistoryClient>) {
        let client = Arc::new(MemoryHistoryClient::new());
        (history_with_client(client.clone(), threshold), client)
    }

    /// Takes a while to accept each delivery
    struct SlowClient {
        inner: MemoryHistoryClient,
        delay: Duration,
    }

    #[async_trait]
    impl HistoryClient for SlowClient {
        async fn send(&self, project_id: &str, entries: &[Value]) -> Result<(), HistoryError> {
            tokio::time::sleep(self.delay).await;
            self.inner.send(project_id, entries).await
        }
    }

    #[test]
    fn test_should_flush_on_threshold_crossing() {
        assert!(!should_flush(499, 1, 500));
        assert!(should_flush(500, 1, 500));
        assert!(should_flush(502, 5, 500));
        assert!(!should_flush(501, 1, 500));
        assert!(!should_flush(0, 0, 500));
    }

    #[test]
    fn test_entry_wire_shape() {
        let entry = RenameEntry {
            entity: Entity::Doc("doc-1".into()),
            pathname: "/a.tex".into(),
            new_pathname: "/b.tex".into(),
            version: "4.0".into(),
            meta: HistoryMeta {
                user_id: Some("u1".into()),
                ts: 1,
                pathname: None,
                doc_length: None,
            },
            project_history_id: None,
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({
                "doc": "doc-1",
                "pathname": "/a.tex",
                "new_pathname": "/b.tex",
                "version": "4.0",
                "meta": {"user_id": "u1", "ts": 1}
            })
        );

        let resync = ResyncDocContentEntry {
            resync_doc_content: ResyncContent {
                content: "a\nb".into(),
                version: 7,
            },
            project_history_id: Some("h1".into()),
            path: "/a.tex".into(),
            doc: "doc-1".into(),
            meta: HistoryMeta {
                user_id: None,
                ts: 2,
                pathname: None,
                doc_length: None,
            },
        };
        assert_eq!(
            serde_json::to_value(&resync).unwrap(),
            json!({
                "resyncDocContent": {"content": "a\nb", "version": 7},
                "projectHistoryId": "h1",
                "path": "/a.tex",
                "doc": "doc-1",
                "meta": {"user_id": null, "ts": 2}
            })
        );
    }

    #[test]
    fn test_queue_push_and_acknowledge() {
        let (history, _) = test_history(500);
        let queue = history.queue();

        assert_eq!(queue.push("p", &[json!({"n": 1}), json!({"n": 2})]).unwrap(), 2);
        assert_eq!(queue.push("p", &[json!({"n": 3})]).unwrap(), 3);
        assert!(queue.first_op_timestamp("p").unwrap().is_some());

        let delivered = queue.pending_encoded("p").unwrap();
        assert_eq!(queue.acknowledge("p", &delivered[..2]).unwrap(), 2);
        assert_eq!(queue.pending("p").unwrap(), vec![json!({"n": 3})]);

        assert_eq!(queue.acknowledge("p", &delivered[2..]).unwrap(), 1);
        assert_eq!(queue.first_op_timestamp("p").unwrap(), None);
    }

    #[test]
    fn test_acknowledge_with_stale_snapshot_keeps_newer_entries() {
        let (history, _) = test_history(500);
        let queue = history.queue();
        queue.push("p", &[json!({"n": 1})]).unwrap();
        let first_snapshot = queue.pending_encoded("p").unwrap();
        queue.push("p", &[json!({"n": 2})]).unwrap();

        assert_eq!(queue.acknowledge("p", &first_snapshot).unwrap(), 1);
        // already gone: nothing else may be popped in its place
        assert_eq!(queue.acknowledge("p", &first_snapshot).unwrap(), 0);
        assert_eq!(queue.pending("p").unwrap(), vec![json!({"n": 2})]);
        assert!(queue.first_op_timestamp("p").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overlapping_flushes_deliver_every_entry_once() {
        let client = Arc::new(SlowClient {
            inner: MemoryHistoryClient::new(),
            delay: Duration::from_millis(50),
        });
        let history = history_with_client(client.clone(), 500);

        history.queue().push("p", &[json!({"n": 1})]).unwrap();
        let first = tokio::spawn({
            let history = history.clone();
            async move { history.flush_project_changes("p").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        history.queue().push("p", &[json!({"n": 2})]).unwrap();
        let second = tokio::spawn({
            let history = history.clone();
            async move { history.flush_project_changes("p").await }
        });
        history.queue().push("p", &[json!({"n": 3})]).unwrap();

        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(second.await.unwrap().unwrap(), 2);
        assert_eq!(
            client.inner.entries_for("p"),
            vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]
        );
        assert_eq!(history.queue().len("p").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entries_pushed_during_delivery_stay_queued() {
        let client = Arc::new(SlowClient {
            inner: MemoryHistoryClient::new(),
            delay: Duration::from_millis(30),
        });
        let history = history_with_client(client.clone(), 500);
        history.queue().push("p", &[json!({"n": 1})]).unwrap();

        let flush = tokio::spawn({
            let history = history.clone();
            async move { history.flush_project_changes("p").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        history.queue().push("p", &[json!({"n": 2})]).unwrap();

        assert_eq!(flush.await.unwrap().unwrap(), 1);
        assert_eq!(history.queue().pending("p").unwrap(), vec![json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order() {
        let (history, client) = test_history(500);
        history
            .queue()
            .push("p", &[json!({"n": 1}), json!({"n": 2})])
            .unwrap();

        assert_eq!(history.flush_project_changes("p").await.unwrap(), 2);
        assert_eq!(client.entries_for("p"), vec![json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(history.queue().len("p").unwrap(), 0);
        assert_eq!(history.flush_project_changes("p").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_entries() {
        let (history, client) = test_history(500);
        history.queue().push("p", &[json!({"n": 1})]).unwrap();
        client.set_failing(true);

        assert!(history.flush_project_changes("p").await.is_err());
        assert_eq!(history.queue().len("p").unwrap(), 1);
    }
}
