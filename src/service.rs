//! Wiring of the sync components into one shareable service.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::DocumentCache;
use crate::fast::FastStore;
use crate::history::{HistoryClient, HistoryManager};
use crate::lock::{LockConfig, LockManager};
use crate::storage::DocPersistence;
use crate::sync::flush::BackgroundTaskHandles;
use crate::sync::{
    DispatchConfig, Dispatcher, DocumentManager, FlushConfig, FlushManager, ProjectCoordinator,
    SyncConfig, Synchronizer,
};

/// Settings for every component
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub lock: LockConfig,
    pub sync: SyncConfig,
    pub dispatch: DispatchConfig,
    pub flush: FlushConfig,
}

impl ServiceConfig {
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_flush(mut self, flush: FlushConfig) -> Self {
        self.flush = flush;
        self
    }
}

struct RunningTasks {
    workers: Vec<JoinHandle<()>>,
    background: BackgroundTaskHandles,
}

/// The document sync service
pub struct DocSync {
    pub store: Arc<FastStore>,
    pub cache: Arc<DocumentCache>,
    pub locks: Arc<LockManager>,
    pub history: Arc<HistoryManager>,
    pub manager: Arc<DocumentManager>,
    pub synchronizer: Arc<Synchronizer>,
    pub dispatcher: Arc<Dispatcher>,
    pub flush: Arc<FlushManager>,
    pub projects: Arc<ProjectCoordinator>,
    pub config: ServiceConfig,
    tasks: Mutex<Option<RunningTasks>>,
}

impl DocSync {
    pub fn new(
        config: ServiceConfig,
        persistence: Arc<dyn DocPersistence>,
        history_client: Arc<dyn HistoryClient>,
    ) -> Self {
        let store = Arc::new(FastStore::new());
        let cache = Arc::new(DocumentCache::new(store.clone(), config.sync.max_doc_length));
        let locks = Arc::new(LockManager::new(store.clone(), config.lock.clone()));
        let history = Arc::new(HistoryManager::new(
            store.clone(),
            locks.clone(),
            history_client,
            config.sync.history_flush_threshold,
        ));
        let manager = Arc::new(DocumentManager::new(
            cache.clone(),
            persistence,
            history.clone(),
            config.sync.clone(),
        ));
        let synchronizer = Arc::new(Synchronizer::new(
            store.clone(),
            locks.clone(),
            manager.clone(),
            history.clone(),
            config.sync.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            synchronizer.clone(),
            config.dispatch.clone(),
        ));
        let flush = Arc::new(FlushManager::new(
            synchronizer.clone(),
            history.clone(),
            config.sync.clone(),
            config.flush.clone(),
        ));
        let projects = Arc::new(ProjectCoordinator::new(
            synchronizer.clone(),
            locks.clone(),
            history.clone(),
        ));

        Self {
            store,
            cache,
            locks,
            history,
            manager,
            synchronizer,
            dispatcher,
            flush,
            projects,
            config,
            tasks: Mutex::new(None),
        }
    }

    /// Start the update workers and the flush loops. Calling it again while
    /// running does nothing.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }
        let workers = self.dispatcher.start();
        let background = self.flush.clone().start_background_tasks();
        info!("Document sync service started");
        *tasks = Some(RunningTasks {
            workers,
            background,
        });
    }

    /// Stop the workers, flush everything once more and wait for the
    /// background tasks to finish.
    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            return;
        };
        self.dispatcher.shutdown();
        self.flush.shutdown();
        futures_util::future::join_all(tasks.workers).await;
        tasks.background.wait().await;
        info!("Document sync service stopped");
    }

    pub fn persistence(&self) -> &Arc<dyn DocPersistence> {
        self.manager.persistence()
    }
}

#[cfg(test)]
mod tests {
    use crate::document::Update;
    use crate::ot::Op;
    use crate::storage::DocPersistence;
    use crate::test_support::{seed_durable, TestService};

    #[tokio::test]
    async fn test_start_and_shutdown_flushes() {
        let svc = TestService::new();
        seed_durable(&svc, "p", "d", &["abc"], 2).await;
        svc.service.start();
        svc.service.start();

        let version = svc
            .dispatcher
            .submit_and_wait("p", "d", Update::new(vec![Op::insert(3, "d")], 2))
            .await
            .unwrap();
        assert_eq!(version, 3);

        svc.service.shutdown().await;
        let stored = svc.persistence.get_doc("p", "d").await.unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.lines, vec!["abcd".to_string()]);

        // second shutdown is a no-op
        svc.service.shutdown().await;
    }
}
