//! Shared fixtures for unit tests.

use async_trait::async_trait;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use crate::history::MemoryHistoryClient;
use crate::lock::LockConfig;
use crate::service::{DocSync, ServiceConfig};
use crate::storage::{
    DocPersistence, PersistedDoc, SledDocStore, StorageConfig, StorageError, StorageResult,
};
use crate::sync::{DispatchConfig, FlushConfig, SyncConfig};

pub fn lines(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

/// Sled store whose writes can be made to fail
pub struct FlakyStore {
    inner: SledDocStore,
    pub writes: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: SledDocStore) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` calls to `set_doc`.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocPersistence for FlakyStore {
    async fn get_doc(&self, project_id: &str, doc_id: &str) -> StorageResult<PersistedDoc> {
        self.inner.get_doc(project_id, doc_id).await
    }

    async fn set_doc(
        &self,
        project_id: &str,
        doc_id: &str,
        doc: &PersistedDoc,
    ) -> StorageResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        self.inner.set_doc(project_id, doc_id, doc).await
    }

    async fn delete_doc(&self, project_id: &str, doc_id: &str) -> StorageResult<()> {
        self.inner.delete_doc(project_id, doc_id).await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.inner.ping().await
    }
}

/// A full service over a temporary sled store and an in-memory history
/// receiver. Dereferences to the service.
pub struct TestService {
    pub service: Arc<DocSync>,
    pub persistence: Arc<FlakyStore>,
    pub history_client: Arc<MemoryHistoryClient>,
    _dir: TempDir,
}

impl Deref for TestService {
    type Target = DocSync;

    fn deref(&self) -> &DocSync {
        &self.service
    }
}

fn test_lock_config() -> LockConfig {
    LockConfig::default()
        .with_max_wait(Duration::from_secs(2))
        .with_poll_interval(Duration::from_millis(5))
}

impl TestService {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default().with_lock(test_lock_config()))
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sled").to_string_lossy().to_string();
        let sled = SledDocStore::open(StorageConfig::new(path)).unwrap();
        let persistence = Arc::new(FlakyStore::new(sled));
        let history_client = Arc::new(MemoryHistoryClient::new());
        let service = Arc::new(DocSync::new(
            config,
            persistence.clone(),
            history_client.clone(),
        ));
        Self {
            service,
            persistence,
            history_client,
            _dir: dir,
        }
    }

    pub fn with_sync_config(sync: SyncConfig) -> Self {
        Self::with_config(
            ServiceConfig::default()
                .with_lock(test_lock_config())
                .with_sync(sync),
        )
    }

    pub fn with_lock_ttl(ttl: Duration) -> Self {
        Self::with_config(ServiceConfig::default().with_lock(test_lock_config().with_ttl(ttl)))
    }

    pub fn with_dispatch_config(dispatch: DispatchConfig) -> Self {
        Self::with_configs(test_lock_config(), dispatch)
    }

    pub fn with_configs(lock: LockConfig, dispatch: DispatchConfig) -> Self {
        Self::with_config(
            ServiceConfig::default()
                .with_lock(lock)
                .with_dispatch(dispatch),
        )
    }

    pub fn with_flush_config(flush: FlushConfig) -> Self {
        Self::with_config(
            ServiceConfig::default()
                .with_lock(test_lock_config())
                .with_flush(flush),
        )
    }
}

/// Write a durable record directly, bypassing the cache. The pathname is
/// `/{doc_id}.tex`.
pub async fn seed_durable(
    svc: &TestService,
    project_id: &str,
    doc_id: &str,
    text: &[&str],
    version: u64,
) {
    let doc = PersistedDoc::new(project_id, lines(text), version)
        .with_pathname(format!("/{}.tex", doc_id));
    svc.persistence
        .inner
        .set_doc(project_id, doc_id, &doc)
        .await
        .unwrap();
}
