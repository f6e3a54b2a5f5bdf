//! Applying updates under the document lock.
//!
//! Per update, in order: lock, load, version check, transform, cache write,
//! history enqueue, unlock. Pending updates for a document sit in a FIFO in
//! the fast store; whoever holds the document lock drains it, so updates
//! are applied in submission order no matter which worker picks them up.

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::manager::DocumentManager;
use super::{SyncConfig, SyncError, SyncResult};
use crate::cache::{now_ms, DocumentCache};
use crate::document::{Document, Update};
use crate::fast::FastStore;
use crate::history::{DocUpdateEntry, HistoryManager, HistoryMeta};
use crate::lock::{doc_lock_key, LockManager};
use crate::ot;

/// Shared list of `project_id:doc_id` keys with pending updates
pub const PENDING_UPDATES_LIST: &str = "pending-updates-list";

pub fn pending_updates_key(doc_id: &str) -> String {
    format!("PendingUpdates:{{{}}}", doc_id)
}

/// Outcome of one update, published to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct AppliedOpsMessage {
    pub project_id: String,
    pub doc_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<Update>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Synchronizer {
    store: Arc<FastStore>,
    cache: Arc<DocumentCache>,
    locks: Arc<LockManager>,
    manager: Arc<DocumentManager>,
    history: Arc<HistoryManager>,
    config: SyncConfig,
    waiters: DashMap<String, oneshot::Sender<SyncResult<u64>>>,
    applied_tx: broadcast::Sender<AppliedOpsMessage>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<FastStore>,
        locks: Arc<LockManager>,
        manager: Arc<DocumentManager>,
        history: Arc<HistoryManager>,
        config: SyncConfig,
    ) -> Self {
        let (applied_tx, _) = broadcast::channel(1024);
        Self {
            store,
            cache: manager.cache().clone(),
            locks,
            manager,
            history,
            config,
            waiters: DashMap::new(),
            applied_tx,
        }
    }

    pub fn manager(&self) -> &Arc<DocumentManager> {
        &self.manager
    }

    /// Feed of applied and failed updates
    pub fn subscribe(&self) -> broadcast::Receiver<AppliedOpsMessage> {
        self.applied_tx.subscribe()
    }

    fn publish(&self, message: AppliedOpsMessage) {
        // no subscribers is fine
        let _ = self.applied_tx.send(message);
    }

    // ------------------------------------------------------------------
    // Pending queue and waiters
    // ------------------------------------------------------------------

    /// Register interest in the outcome of update `id`.
    pub fn register_waiter(&self, id: &str) -> oneshot::Receiver<SyncResult<u64>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.to_string(), tx);
        rx
    }

    pub fn forget_waiter(&self, id: &str) {
        self.waiters.remove(id);
    }

    fn complete(&self, id: &str, result: SyncResult<u64>) {
        if let Some((_, tx)) = self.waiters.remove(id) {
            let _ = tx.send(result);
        }
    }

    /// Append an update to the document's pending FIFO.
    pub fn enqueue(&self, doc_id: &str, update: &Update) -> SyncResult<usize> {
        let json = serde_json::to_string(update)
            .map_err(|e| SyncError::InvalidUpdate(e.to_string()))?;
        Ok(self.store.rpush(&pending_updates_key(doc_id), vec![json])?)
    }

    /// Take a still-queued update back out of the document's FIFO. False
    /// when a worker already picked it up.
    pub fn withdraw(&self, doc_id: &str, update: &Update) -> SyncResult<bool> {
        let json = serde_json::to_string(update)
            .map_err(|e| SyncError::InvalidUpdate(e.to_string()))?;
        Ok(self.store.lrem(&pending_updates_key(doc_id), &json)?)
    }

    pub fn pending_len(&self, doc_id: &str) -> SyncResult<usize> {
        Ok(self.store.llen(&pending_updates_key(doc_id))?)
    }

    /// Drop every pending update of a document, failing their waiters.
    pub fn fail_pending(&self, project_id: &str, doc_id: &str, err: SyncError) -> SyncResult<usize> {
        let key = pending_updates_key(doc_id);
        let mut failed = 0;
        loop {
            let batch = self.store.lpop_n(&key, self.config.max_ops_per_iteration)?;
            if batch.is_empty() {
                return Ok(failed);
            }
            for raw in batch {
                if let Ok(update) = serde_json::from_str::<Update>(&raw) {
                    self.publish_error(project_id, doc_id, &err);
                    self.complete(&update.id, Err(err.clone()));
                }
                failed += 1;
            }
        }
    }

    fn publish_error(&self, project_id: &str, doc_id: &str, err: &SyncError) {
        self.publish(AppliedOpsMessage {
            project_id: project_id.to_string(),
            doc_id: doc_id.to_string(),
            op: None,
            version: None,
            error: Some(err.to_string()),
        });
    }

    // ------------------------------------------------------------------
    // Applying updates
    // ------------------------------------------------------------------

    /// Apply one update. The caller must hold the document lock.
    pub async fn apply_update(
        &self,
        project_id: &str,
        doc_id: &str,
        mut update: Update,
    ) -> SyncResult<u64> {
        let (doc, _) = self.manager.get_doc(project_id, doc_id).await?;

        if update.v < doc.version {
            debug!(
                "Rejecting stale update to doc {}: v{} < v{}",
                doc_id, update.v, doc.version
            );
            return Err(SyncError::StaleUpdate(format!(
                "update at v{} but doc {} is at v{}",
                update.v, doc_id, doc.version
            )));
        }
        if update.v > doc.version {
            return Err(SyncError::InvalidUpdate(format!(
                "update at v{} is ahead of doc {} at v{}",
                update.v, doc_id, doc.version
            )));
        }

        let applied = ot::apply(&doc.lines, &update.op)?;
        if applied.byte_len > self.config.max_doc_length {
            return Err(SyncError::TooLarge(format!(
                "update would grow doc {} to {} bytes",
                doc_id, applied.byte_len
            )));
        }

        let new_version = doc.version + 1;
        let ts = now_ms();
        update.meta.ts = Some(ts);
        let ranges = update.ranges.clone().or_else(|| doc.ranges.clone());
        let user_id = update.meta.user_id.clone();

        self.cache.update_document(
            project_id,
            doc_id,
            &applied.lines,
            new_version,
            std::slice::from_ref(&update),
            ranges,
            user_id.as_deref(),
        )?;

        let entry = DocUpdateEntry {
            doc: doc_id.to_string(),
            op: update.op.clone(),
            v: update.v,
            version: new_version,
            meta: HistoryMeta {
                user_id,
                ts,
                pathname: Some(doc.pathname.clone()),
                doc_length: Some(doc.byte_len()),
            },
            project_history_id: doc.project_history_id.clone(),
        };
        let queue_len = self.history.queue().push(project_id, &[entry])?;
        self.history
            .flush_if_threshold_crossed(project_id, queue_len, 1);

        debug!("Applied update to doc {}, now v{}", doc_id, new_version);
        self.publish(AppliedOpsMessage {
            project_id: project_id.to_string(),
            doc_id: doc_id.to_string(),
            op: Some(update),
            version: Some(new_version),
            error: None,
        });
        Ok(new_version)
    }

    /// Apply an update directly, under the lock.
    pub async fn apply_update_with_lock(
        &self,
        project_id: &str,
        doc_id: &str,
        update: Update,
    ) -> SyncResult<u64> {
        self.lock_updates_and_do(project_id, doc_id, || async move {
            let result = self.apply_update(project_id, doc_id, update).await;
            if let Err(e) = &result {
                self.publish_error(project_id, doc_id, e);
            }
            result
        })
        .await
    }

    /// Drain the document's pending FIFO. The caller must hold the lock.
    ///
    /// A failing update is reported to its waiter and does not stop the
    /// ones queued after it.
    pub async fn process_outstanding_updates(
        &self,
        project_id: &str,
        doc_id: &str,
    ) -> SyncResult<usize> {
        let key = pending_updates_key(doc_id);
        let mut processed = 0;
        loop {
            let batch = self.store.lpop_n(&key, self.config.max_ops_per_iteration)?;
            if batch.is_empty() {
                break;
            }
            debug!("Applying {} pending updates to doc {}", batch.len(), doc_id);
            for raw in batch {
                let update: Update = match serde_json::from_str(&raw) {
                    Ok(update) => update,
                    Err(e) => {
                        error!("Dropping unreadable pending update for doc {}: {}", doc_id, e);
                        continue;
                    }
                };
                let id = update.id.clone();
                let result = self.apply_update(project_id, doc_id, update).await;
                if let Err(e) = &result {
                    warn!("Update {} to doc {} failed: {}", id, doc_id, e);
                    self.publish_error(project_id, doc_id, e);
                }
                self.complete(&id, result);
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Acquire the document lock and drain its pending updates.
    pub async fn process_outstanding_updates_with_lock(
        &self,
        project_id: &str,
        doc_id: &str,
    ) -> SyncResult<usize> {
        let key = doc_lock_key(doc_id);
        let result = self
            .locks
            .run_with_lock(&key, || self.process_outstanding_updates(project_id, doc_id))
            .await;
        self.continue_processing_updates(project_id, doc_id);
        result
    }

    /// Hand the document back to the dispatcher if updates arrived while
    /// the lock was held.
    fn continue_processing_updates(&self, project_id: &str, doc_id: &str) {
        match self.pending_len(doc_id) {
            Ok(0) => {}
            Ok(n) => {
                debug!("{} updates still pending for doc {}, requeueing", n, doc_id);
                if let Err(e) = self
                    .store
                    .rpush(PENDING_UPDATES_LIST, vec![format!("{}:{}", project_id, doc_id)])
                {
                    error!("Failed to requeue doc {}: {}", doc_id, e);
                }
            }
            Err(e) => error!("Failed to read pending updates of doc {}: {}", doc_id, e),
        }
    }

    /// Run `f` under the document lock, draining pending updates first so
    /// `f` sees the latest state.
    pub async fn lock_updates_and_do<T, F, Fut>(
        &self,
        project_id: &str,
        doc_id: &str,
        f: F,
    ) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let key = doc_lock_key(doc_id);
        let result = self
            .locks
            .run_with_lock(&key, || async move {
                self.process_outstanding_updates(project_id, doc_id).await?;
                f().await
            })
            .await;
        self.continue_processing_updates(project_id, doc_id);
        result
    }

    // ------------------------------------------------------------------
    // Locked document operations
    // ------------------------------------------------------------------

    pub async fn get_doc_with_lock(&self, project_id: &str, doc_id: &str) -> SyncResult<Document> {
        self.lock_updates_and_do(project_id, doc_id, || async move {
            Ok(self.manager.get_doc(project_id, doc_id).await?.0)
        })
        .await
    }

    pub async fn get_doc_and_recent_ops_with_lock(
        &self,
        project_id: &str,
        doc_id: &str,
        from_version: Option<u64>,
    ) -> SyncResult<(Document, Vec<Update>)> {
        self.lock_updates_and_do(project_id, doc_id, || {
            self.manager
                .get_doc_and_recent_ops(project_id, doc_id, from_version)
        })
        .await
    }

    /// Replace the document's content with `lines`.
    ///
    /// The difference is applied as an ordinary update, so it gets a version
    /// and a history entry. The document is flushed afterwards, and dropped
    /// from the cache again if it was not cached before.
    pub async fn set_doc(
        &self,
        project_id: &str,
        doc_id: &str,
        lines: Vec<String>,
        source: Option<String>,
        user_id: Option<String>,
    ) -> SyncResult<()> {
        let (doc, already_loaded) = self.manager.get_doc(project_id, doc_id).await?;

        if doc.lines == lines {
            debug!("Set doc {}: content unchanged", doc_id);
        } else {
            let mut update = Update::new(ot::diff_lines(&doc.lines, &lines), doc.version);
            update.meta.source = source;
            update.meta.user_id = user_id;
            self.apply_update(project_id, doc_id, update).await?;
        }

        if already_loaded {
            self.manager.flush_doc_if_loaded(project_id, doc_id).await?;
        } else {
            self.manager
                .flush_and_delete_doc(project_id, doc_id, false)
                .await?;
        }
        info!("Set doc {} of project {}", doc_id, project_id);
        Ok(())
    }

    pub async fn set_doc_with_lock(
        &self,
        project_id: &str,
        doc_id: &str,
        lines: Vec<String>,
        source: Option<String>,
        user_id: Option<String>,
    ) -> SyncResult<()> {
        self.lock_updates_and_do(project_id, doc_id, || {
            self.set_doc(project_id, doc_id, lines, source, user_id)
        })
        .await
    }

    pub async fn flush_doc_if_loaded_with_lock(
        &self,
        project_id: &str,
        doc_id: &str,
    ) -> SyncResult<bool> {
        self.lock_updates_and_do(project_id, doc_id, || {
            self.manager.flush_doc_if_loaded(project_id, doc_id)
        })
        .await
    }

    pub async fn flush_and_delete_doc_with_lock(
        &self,
        project_id: &str,
        doc_id: &str,
        ignore_flush_errors: bool,
    ) -> SyncResult<()> {
        self.lock_updates_and_do(project_id, doc_id, || {
            self.manager
                .flush_and_delete_doc(project_id, doc_id, ignore_flush_errors)
        })
        .await
    }

    pub async fn delete_doc_with_lock(&self, project_id: &str, doc_id: &str) -> SyncResult<()> {
        self.lock_updates_and_do(project_id, doc_id, || {
            self.manager.delete_doc(project_id, doc_id)
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn rename_doc_with_lock(
        &self,
        project_id: &str,
        doc_id: &str,
        pathname: &str,
        new_pathname: &str,
        version: &str,
        user_id: Option<String>,
        project_history_id: Option<String>,
    ) -> SyncResult<usize> {
        self.lock_updates_and_do(project_id, doc_id, || async move {
            self.manager.rename_doc(
                project_id,
                doc_id,
                pathname,
                new_pathname,
                version,
                user_id,
                project_history_id,
            )
        })
        .await
    }

    pub async fn resync_doc_contents_with_lock(
        &self,
        project_id: &str,
        doc_id: &str,
    ) -> SyncResult<usize> {
        self.lock_updates_and_do(project_id, doc_id, || {
            self.manager.resync_doc_contents(project_id, doc_id)
        })
        .await
    }

    pub async fn get_doc_and_flush_if_old_with_lock(
        &self,
        project_id: &str,
        doc_id: &str,
    ) -> SyncResult<Document> {
        self.lock_updates_and_do(project_id, doc_id, || {
            self.manager.get_doc_and_flush_if_old(project_id, doc_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockError;
    use crate::ot::Op;
    use crate::storage::DocPersistence;
    use crate::test_support::{lines, seed_durable, TestService};

    #[tokio::test]
    async fn test_apply_update_advances_version() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["hello world"], 3).await;

        let version = svc
            .synchronizer
            .apply_update_with_lock("p", "d", Update::new(vec![Op::insert(5, ",")], 3))
            .await
            .unwrap();
        assert_eq!(version, 4);

        let doc = svc.synchronizer.get_doc_with_lock("p", "d").await.unwrap();
        assert_eq!(doc.lines, lines(&["hello, world"]));
        assert_eq!(doc.version, 4);
        assert!(doc.is_dirty());
    }

    #[tokio::test]
    async fn test_stale_update_leaves_doc_unchanged() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["abc"], 5).await;

        let err = svc
            .synchronizer
            .apply_update_with_lock("p", "d", Update::new(vec![Op::insert(0, "x")], 4))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::StaleUpdate(_)));

        let doc = svc.synchronizer.get_doc_with_lock("p", "d").await.unwrap();
        assert_eq!(doc.lines, lines(&["abc"]));
        assert_eq!(doc.version, 5);
        assert!(!doc.is_dirty());
    }

    #[tokio::test]
    async fn test_content_mismatch_is_reported() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["abc"], 0).await;
        let mut feed = svc.synchronizer.subscribe();

        let err = svc
            .synchronizer
            .apply_update_with_lock("p", "d", Update::new(vec![Op::delete(0, "zz")], 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ContentMismatch(_)));

        let message = feed.recv().await.unwrap();
        assert!(message.error.is_some());
        assert_eq!(svc.history.queue().len("p").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_future_version_is_invalid() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["abc"], 1).await;

        let err = svc
            .synchronizer
            .apply_update_with_lock("p", "d", Update::new(vec![Op::insert(0, "x")], 9))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidUpdate(_)));
    }

    #[tokio::test]
    async fn test_concurrent_edits_at_same_version() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["hello"], 3).await;

        let first = Update::new(vec![Op::insert(5, "!")], 3);
        let second = Update::new(vec![Op::insert(0, ">")], 3);
        let (a, b) = tokio::join!(
            svc.synchronizer.apply_update_with_lock("p", "d", first),
            svc.synchronizer.apply_update_with_lock("p", "d", second.clone()),
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(SyncError::StaleUpdate(_)))));

        // the loser rebases its op onto v4 and resubmits
        let (lost_op, expected) = if results[0].is_err() {
            (Op::insert(6, "!"), ">hello!")
        } else {
            (second.op[0].clone(), ">hello!")
        };
        let version = svc
            .synchronizer
            .apply_update_with_lock("p", "d", Update::new(vec![lost_op], 4))
            .await
            .unwrap();
        assert_eq!(version, 5);

        let doc = svc.synchronizer.get_doc_with_lock("p", "d").await.unwrap();
        assert_eq!(doc.lines, lines(&[expected]));
    }

    #[tokio::test]
    async fn test_pending_updates_apply_in_order() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &[""], 0).await;

        let mut receivers = Vec::new();
        for (v, text) in ["a", "b", "c"].iter().enumerate() {
            let update = Update::new(vec![Op::insert(v, *text)], v as u64);
            receivers.push(svc.synchronizer.register_waiter(&update.id));
            svc.synchronizer.enqueue("d", &update).unwrap();
        }

        let processed = svc
            .synchronizer
            .process_outstanding_updates_with_lock("p", "d")
            .await
            .unwrap();
        assert_eq!(processed, 3);

        let mut versions = Vec::new();
        for rx in receivers {
            versions.push(rx.await.unwrap().unwrap());
        }
        assert_eq!(versions, vec![1, 2, 3]);

        let doc = svc.synchronizer.get_doc_with_lock("p", "d").await.unwrap();
        assert_eq!(doc.lines, lines(&["abc"]));
    }

    #[tokio::test]
    async fn test_failed_update_does_not_block_queue() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["x"], 0).await;

        let bad = Update::new(vec![Op::delete(0, "nope")], 0);
        let good = Update::new(vec![Op::insert(1, "y")], 0);
        let bad_rx = svc.synchronizer.register_waiter(&bad.id);
        let good_rx = svc.synchronizer.register_waiter(&good.id);
        svc.synchronizer.enqueue("d", &bad).unwrap();
        svc.synchronizer.enqueue("d", &good).unwrap();

        svc.synchronizer
            .process_outstanding_updates_with_lock("p", "d")
            .await
            .unwrap();

        assert!(matches!(
            bad_rx.await.unwrap(),
            Err(SyncError::ContentMismatch(_))
        ));
        assert_eq!(good_rx.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_history_entry_per_applied_update() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["x"], 7).await;

        svc.synchronizer
            .apply_update_with_lock(
                "p",
                "d",
                Update::new(vec![Op::insert(1, "y")], 7).with_user("u1"),
            )
            .await
            .unwrap();

        let pending = svc.history.queue().pending("p").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["doc"], "d");
        assert_eq!(pending[0]["v"], 7);
        assert_eq!(pending[0]["version"], 8);
        assert_eq!(pending[0]["meta"]["user_id"], "u1");
        assert_eq!(pending[0]["meta"]["pathname"], "/d.tex");
    }

    #[tokio::test]
    async fn test_history_flushed_when_threshold_crossed() {
        let svc = TestService::with_sync_config(
            SyncConfig::default().with_history_flush_threshold(2),
        );
        seed_durable(&svc, "p", "d", &[""], 0).await;

        for v in 0..2u64 {
            svc.synchronizer
                .apply_update_with_lock("p", "d", Update::new(vec![Op::insert(0, "x")], v))
                .await
                .unwrap();
        }

        for _ in 0..50 {
            if !svc.history_client.entries_for("p").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(svc.history_client.entries_for("p").len(), 2);
    }

    #[tokio::test]
    async fn test_ranges_are_kept_unless_replaced() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["abc"], 0).await;
        let ranges = serde_json::json!({"comments": [{"id": "c1", "op": {"p": 0, "c": "a"}}]});

        svc.synchronizer
            .apply_update_with_lock(
                "p",
                "d",
                Update::new(vec![Op::insert(3, "d")], 0).with_ranges(ranges.clone()),
            )
            .await
            .unwrap();
        svc.synchronizer
            .apply_update_with_lock("p", "d", Update::new(vec![Op::insert(4, "e")], 1))
            .await
            .unwrap();

        let doc = svc.synchronizer.get_doc_with_lock("p", "d").await.unwrap();
        assert_eq!(doc.ranges, Some(ranges));
    }

    #[tokio::test]
    async fn test_set_doc_on_unloaded_doc_flushes_and_evicts() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["one", "two"], 2).await;

        svc.synchronizer
            .set_doc_with_lock("p", "d", lines(&["one", "2"]), Some("editor".into()), Some("u1".into()))
            .await
            .unwrap();

        assert!(!svc.cache.is_loaded("d"));
        let stored = svc.persistence.get_doc("p", "d").await.unwrap();
        assert_eq!(stored.lines, lines(&["one", "2"]));
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn test_set_doc_on_loaded_doc_flushes_in_place() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["one"], 2).await;
        svc.synchronizer.get_doc_with_lock("p", "d").await.unwrap();

        svc.synchronizer
            .set_doc_with_lock("p", "d", lines(&["uno"]), None, None)
            .await
            .unwrap();

        let doc = svc.synchronizer.get_doc_with_lock("p", "d").await.unwrap();
        assert_eq!(doc.lines, lines(&["uno"]));
        assert!(!doc.is_dirty());
        assert_eq!(svc.persistence.get_doc("p", "d").await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_set_doc_too_large_is_rejected() {
        let svc = TestService::with_sync_config(SyncConfig::default().with_max_doc_length(16));
        seed_durable(&svc, "p", "d", &["small"], 0).await;

        let err = svc
            .synchronizer
            .set_doc_with_lock("p", "d", vec!["x".repeat(64)], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TooLarge(_)));
    }

    #[tokio::test]
    async fn test_recent_ops_since_version() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &[""], 0).await;
        for v in 0..3u64 {
            svc.synchronizer
                .apply_update_with_lock("p", "d", Update::new(vec![Op::insert(0, "x")], v))
                .await
                .unwrap();
        }

        let (doc, ops) = svc
            .synchronizer
            .get_doc_and_recent_ops_with_lock("p", "d", Some(1))
            .await
            .unwrap();
        assert_eq!(doc.version, 3);
        assert_eq!(ops.iter().map(|u| u.v).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_holder_lock_expires() {
        let svc = TestService::with_lock_ttl(std::time::Duration::from_millis(100));
        seed_durable(&svc, "p", "d", &["abc"], 0).await;

        let key = doc_lock_key("d");
        let crashed = svc.locks.try_lock(&key).unwrap();
        tokio::time::advance(std::time::Duration::from_millis(150)).await;

        let version = svc
            .synchronizer
            .apply_update_with_lock("p", "d", Update::new(vec![Op::insert(3, "d")], 0))
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(
            svc.locks.release(&key, &crashed),
            Err(LockError::Expired(key.clone()))
        );
    }
}
