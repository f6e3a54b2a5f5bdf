//! Flushing and eviction.
//!
//! Dirty documents are persisted when asked, when they have been dirty for
//! longer than the configured age, and on shutdown. Clean documents nobody
//! has read for a while are evicted. Projects can be queued for a deferred
//! flush-and-delete, which a background task works through.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::manager::is_older_than;
use super::updater::Synchronizer;
use super::{SyncConfig, SyncResult};
use crate::cache::{now_ms, DocumentCache};
use crate::history::HistoryManager;

/// Background flush settings
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// How often dirty and idle documents are swept
    pub sweep_interval: Duration,
    /// Clean documents unread for this long are evicted
    pub idle_eviction_timeout: Duration,
    /// How often the deferred flush-and-delete queue is polled
    pub deferred_delete_interval: Duration,
    /// Queued projects are only processed once they are this old
    pub deferred_delete_min_age: Duration,
    /// Projects processed per poll
    pub deferred_delete_batch: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            idle_eviction_timeout: Duration::from_secs(3600),
            deferred_delete_interval: Duration::from_secs(10),
            deferred_delete_min_age: Duration::from_secs(5 * 60),
            deferred_delete_batch: 100,
        }
    }
}

impl FlushConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_idle_eviction_timeout(mut self, timeout: Duration) -> Self {
        self.idle_eviction_timeout = timeout;
        self
    }

    pub fn with_deferred_delete_min_age(mut self, min_age: Duration) -> Self {
        self.deferred_delete_min_age = min_age;
        self
    }
}

/// Outcome of [`FlushManager::flush_all_projects`]
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushAllReport {
    pub flushed: Vec<String>,
    pub failed: Vec<String>,
}

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SweepReport {
    pub flushed: usize,
    pub evicted: usize,
    pub failed: usize,
}

pub struct FlushManager {
    synchronizer: Arc<Synchronizer>,
    cache: Arc<DocumentCache>,
    history: Arc<HistoryManager>,
    sync_config: SyncConfig,
    config: FlushConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl FlushManager {
    pub fn new(
        synchronizer: Arc<Synchronizer>,
        history: Arc<HistoryManager>,
        sync_config: SyncConfig,
        config: FlushConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            cache: synchronizer.manager().cache().clone(),
            synchronizer,
            history,
            sync_config,
            config,
            shutdown_tx,
        }
    }

    /// Flush every cached document of a project. All documents are tried;
    /// the first failure is returned.
    pub async fn flush_project(&self, project_id: &str) -> SyncResult<usize> {
        let doc_ids = self.cache.doc_ids_in_project(project_id)?;
        debug!("Flushing {} docs of project {}", doc_ids.len(), project_id);

        let mut flushed = 0;
        let mut first_error = None;
        for doc_id in doc_ids {
            match self
                .synchronizer
                .flush_doc_if_loaded_with_lock(project_id, &doc_id)
                .await
            {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to flush doc {} of project {}: {}", doc_id, project_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Flush and evict every cached document of a project, then deliver
    /// its history. A document that fails to flush stays cached.
    pub async fn flush_and_delete_project(&self, project_id: &str) -> SyncResult<()> {
        let doc_ids = self.cache.doc_ids_in_project(project_id)?;
        let mut first_error = None;
        for doc_id in &doc_ids {
            if let Err(e) = self
                .synchronizer
                .flush_and_delete_doc_with_lock(project_id, doc_id, false)
                .await
            {
                error!(
                    "Failed to flush and delete doc {} of project {}: {}",
                    doc_id, project_id, e
                );
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.history.flush_project_changes(project_id).await {
            warn!("History flush for project {} failed: {}", project_id, e);
        }
        self.cache.clear_project_state(project_id);

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    "Flushed and deleted {} docs of project {}",
                    doc_ids.len(),
                    project_id
                );
                Ok(())
            }
        }
    }

    /// Schedule a project for the deferred flush-and-delete task.
    pub fn queue_flush_and_delete_project(&self, project_id: &str) -> SyncResult<()> {
        self.cache.queue_flush_and_delete_project(project_id)?;
        debug!("Queued project {} for deferred flush and delete", project_id);
        Ok(())
    }

    /// Process up to `limit` queued projects that were queued at least
    /// `min_age` ago. Returns how many were processed successfully.
    pub async fn flush_queued_projects(&self, limit: usize, min_age: Duration) -> SyncResult<usize> {
        let cutoff = now_ms() - min_age.as_millis() as i64;
        self.flush_queued_projects_until(cutoff, limit).await
    }

    async fn flush_queued_projects_until(&self, cutoff_ms: i64, limit: usize) -> SyncResult<usize> {
        let mut processed = 0;
        for _ in 0..limit {
            let Some((project_id, queued_at, remaining)) =
                self.cache.next_project_to_flush_and_delete(cutoff_ms)?
            else {
                break;
            };
            debug!(
                "Deferred flush of project {} queued at {}, {} remaining",
                project_id, queued_at, remaining
            );
            match self.flush_and_delete_project(&project_id).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    warn!(
                        "Deferred flush of project {} failed, requeueing: {}",
                        project_id, e
                    );
                    self.cache.queue_flush_and_delete_project(&project_id)?;
                }
            }
        }
        Ok(processed)
    }

    /// Flush every cached project.
    pub async fn flush_all_projects(&self) -> FlushAllReport {
        let mut report = FlushAllReport::default();
        for project_id in self.cache.project_ids() {
            match self.flush_project(&project_id).await {
                Ok(_) => report.flushed.push(project_id),
                Err(_) => report.failed.push(project_id),
            }
        }
        info!(
            "Flushed {} projects, {} failed",
            report.flushed.len(),
            report.failed.len()
        );
        report
    }

    /// Flush documents dirty for too long and evict idle clean ones.
    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        let mut report = SweepReport::default();
        for (project_id, doc_id) in self.cache.loaded_docs()? {
            let unflushed = self.cache.unflushed_time(&doc_id)?;
            let result = if unflushed.is_some() {
                if !is_older_than(unflushed, self.sync_config.max_unflushed_age) {
                    continue;
                }
                self.synchronizer
                    .flush_doc_if_loaded_with_lock(&project_id, &doc_id)
                    .await
                    .map(|_| report.flushed += 1)
            } else {
                if !is_older_than(self.cache.last_accessed(&doc_id)?, self.config.idle_eviction_timeout) {
                    continue;
                }
                self.synchronizer
                    .flush_and_delete_doc_with_lock(&project_id, &doc_id, false)
                    .await
                    .map(|_| report.evicted += 1)
            };
            if let Err(e) = result {
                warn!("Sweep of doc {} failed: {}", doc_id, e);
                report.failed += 1;
            }
        }
        if report != SweepReport::default() {
            debug!(
                "Sweep flushed {} docs, evicted {}, {} failed",
                report.flushed, report.evicted, report.failed
            );
        }
        Ok(report)
    }

    fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Start the sweep and deferred-delete tasks. On shutdown the sweep task
    /// flushes every project once more before exiting.
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let flusher = self.clone();
        let sweep_interval = flusher.config.sweep_interval;
        let mut shutdown = flusher.shutdown_receiver();

        // Sweep task
        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = flusher.sweep().await {
                            error!("Sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Sweep task shutting down");
                        // Final flush
                        flusher.flush_all_projects().await;
                        break;
                    }
                }
            }
        });

        let flusher = self.clone();
        let delete_interval = flusher.config.deferred_delete_interval;
        let mut shutdown = flusher.shutdown_receiver();

        // Deferred delete task
        let deferred_delete_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(delete_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let batch = flusher.config.deferred_delete_batch;
                        let min_age = flusher.config.deferred_delete_min_age;
                        match flusher.flush_queued_projects(batch, min_age).await {
                            Ok(0) => {}
                            Ok(n) => debug!("Deferred flush processed {} projects", n),
                            Err(e) => error!("Deferred flush failed: {}", e),
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Deferred delete task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            sweep_task: sweep_handle,
            deferred_delete_task: deferred_delete_handle,
        }
    }
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub sweep_task: tokio::task::JoinHandle<()>,
    pub deferred_delete_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.sweep_task, self.deferred_delete_task);
    }
}
