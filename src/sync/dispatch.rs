//! Worker pool draining the shared pending-updates list.
//!
//! Submitting an update appends it to the document's FIFO and pushes the
//! document key onto the shared list. Each worker pops a key, takes the
//! document lock and drains the FIFO. A document key may sit on the list
//! several times; whoever gets the lock first does the work and the rest
//! find an empty FIFO.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::updater::{Synchronizer, PENDING_UPDATES_LIST};
use super::{SyncError, SyncResult};
use crate::document::Update;
use crate::fast::FastStore;

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Per-document cap on queued updates before submitters are refused
    pub max_pending_updates: usize,
    /// Attempts at the document lock before pending updates are failed
    pub max_lock_retries: u32,
    /// How long a worker blocks on the shared list per poll
    pub poll_timeout: Duration,
    /// How long `submit_and_wait` waits for the outcome
    pub submit_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_pending_updates: 1000,
            max_lock_retries: 3,
            poll_timeout: Duration::from_secs(1),
            submit_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_pending_updates(mut self, max: usize) -> Self {
        self.max_pending_updates = max;
        self
    }

    pub fn with_max_lock_retries(mut self, retries: u32) -> Self {
        self.max_lock_retries = retries;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }
}

fn split_doc_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

pub struct Dispatcher {
    store: Arc<FastStore>,
    synchronizer: Arc<Synchronizer>,
    config: DispatchConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<FastStore>,
        synchronizer: Arc<Synchronizer>,
        config: DispatchConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            synchronizer,
            config,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Queue an update and return a receiver for its outcome.
    ///
    /// Refused with `Backpressure` when the document already has
    /// `max_pending_updates` updates waiting.
    pub fn submit(
        &self,
        project_id: &str,
        doc_id: &str,
        update: Update,
    ) -> SyncResult<tokio::sync::oneshot::Receiver<SyncResult<u64>>> {
        let pending = self.synchronizer.pending_len(doc_id)?;
        if pending >= self.config.max_pending_updates {
            warn!(
                "Refusing update to doc {}: {} updates already pending",
                doc_id, pending
            );
            return Err(SyncError::Backpressure(format!(
                "{} updates pending for doc {}",
                pending, doc_id
            )));
        }

        let rx = self.synchronizer.register_waiter(&update.id);
        if let Err(e) = self.synchronizer.enqueue(doc_id, &update) {
            self.synchronizer.forget_waiter(&update.id);
            return Err(e);
        }
        self.store
            .rpush(PENDING_UPDATES_LIST, vec![format!("{}:{}", project_id, doc_id)])?;
        debug!("Queued update {} for doc {}", update.id, doc_id);
        Ok(rx)
    }

    /// Queue an update and wait for the version it produced.
    ///
    /// On timeout the update is withdrawn from the queue when no worker has
    /// taken it yet, and `LockTimeout` reports that it was not applied.
    /// Otherwise the result is `OutcomeUnknown`.
    pub async fn submit_and_wait(
        &self,
        project_id: &str,
        doc_id: &str,
        update: Update,
    ) -> SyncResult<u64> {
        let id = update.id.clone();
        let queued = update.clone();
        let rx = self.submit(project_id, doc_id, update)?;
        match tokio::time::timeout(self.config.submit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Internal(format!(
                "update {} was dropped before completion",
                id
            ))),
            Err(_) => {
                self.synchronizer.forget_waiter(&id);
                if self.synchronizer.withdraw(doc_id, &queued)? {
                    debug!("Withdrew update {} for doc {} after timeout", id, doc_id);
                    Err(SyncError::LockTimeout(format!(
                        "update {} not applied within {:?}",
                        id, self.config.submit_timeout
                    )))
                } else {
                    warn!(
                        "Update {} for doc {} was picked up but reported nothing within {:?}",
                        id, doc_id, self.config.submit_timeout
                    );
                    Err(SyncError::OutcomeUnknown(format!(
                        "update {} in progress after {:?}",
                        id, self.config.submit_timeout
                    )))
                }
            }
        }
    }

    /// Spawn the workers.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting {} update workers", self.config.workers);
        (0..self.config.workers)
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            popped = dispatcher
                                .store
                                .blpop(PENDING_UPDATES_LIST, dispatcher.config.poll_timeout) => {
                                match popped {
                                    Ok(Some(key)) => dispatcher.process_doc_key(&key).await,
                                    Ok(None) => {}
                                    Err(e) => {
                                        error!("Worker {} failed to poll pending updates: {}", worker, e);
                                        tokio::time::sleep(dispatcher.config.poll_timeout).await;
                                    }
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("Update worker {} shutting down", worker);
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Drain one document, retrying the lock a bounded number of times.
    pub async fn process_doc_key(&self, key: &str) {
        let Some((project_id, doc_id)) = split_doc_key(key) else {
            error!("Malformed pending-updates key: {}", key);
            return;
        };

        let mut attempt = 0;
        loop {
            match self
                .synchronizer
                .process_outstanding_updates_with_lock(project_id, doc_id)
                .await
            {
                Ok(n) => {
                    if n > 0 {
                        debug!("Processed {} updates for doc {}", n, doc_id);
                    }
                    return;
                }
                Err(SyncError::LockTimeout(lock)) => {
                    attempt += 1;
                    if attempt >= self.config.max_lock_retries {
                        warn!(
                            "Could not lock doc {} after {} attempts, failing pending updates",
                            doc_id, attempt
                        );
                        let err = SyncError::LockTimeout(lock);
                        if let Err(e) = self.synchronizer.fail_pending(project_id, doc_id, err) {
                            error!("Failed to drop pending updates of doc {}: {}", doc_id, e);
                        }
                        return;
                    }
                    debug!("Lock on doc {} busy, retry {}", doc_id, attempt);
                }
                Err(e) => {
                    // the lock expired mid-batch; results were still delivered
                    error!("Processing updates for doc {} failed: {}", doc_id, e);
                    return;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
