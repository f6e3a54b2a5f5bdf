//! Per-document mutual exclusion on top of the fast store.
//!
//! A lock is a key holding a random token with a TTL. Only the holder of
//! the token can release it, so a worker whose lock expired cannot free a
//! lock that has since been taken by someone else.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::fast::FastStore;

/// Errors raised while acquiring or releasing a lock
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out acquiring lock {0}")]
    Timeout(String),

    #[error("lock {0} expired before it was released")]
    Expired(String),
}

/// Timing knobs for lock acquisition
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Expiry applied to every lock so crashed holders free it eventually
    pub ttl: Duration,
    /// Give up acquiring after this long
    pub max_wait: Duration,
    /// Delay between attempts
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl LockConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Lock key guarding a document
pub fn doc_lock_key(doc_id: &str) -> String {
    format!("Blocking:{{{}}}", doc_id)
}

/// Lock key guarding structural changes of a project
pub fn project_lock_key(project_id: &str) -> String {
    format!("ProjectBlocking:{{{}}}", project_id)
}

/// Lock key serializing history delivery for a project
pub fn project_history_lock_key(project_id: &str) -> String {
    format!("ProjectHistoryLock:{{{}}}", project_id)
}

pub struct LockManager {
    store: Arc<FastStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<FastStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn new_token() -> String {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        format!("locked:{}:{}", std::process::id(), hex::encode(bytes))
    }

    /// Single attempt. Returns the ownership token, or `None` when held.
    pub fn try_lock(&self, key: &str) -> Option<String> {
        let token = Self::new_token();
        if self.store.set_nx_px(key, token.clone(), self.config.ttl) {
            debug!("Acquired lock {}", key);
            Some(token)
        } else {
            None
        }
    }

    /// Poll [`try_lock`](Self::try_lock) until it succeeds or the configured
    /// wait elapses.
    pub async fn acquire(&self, key: &str) -> Result<String, LockError> {
        self.acquire_within(key, self.config.max_wait, self.config.poll_interval)
            .await
    }

    pub async fn acquire_within(
        &self,
        key: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<String, LockError> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(token) = self.try_lock(key) {
                return Ok(token);
            }
            if Instant::now() + poll_interval > deadline {
                debug!("Gave up waiting for lock {}", key);
                return Err(LockError::Timeout(key.to_string()));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Release a lock held with `token`.
    ///
    /// Fails with [`LockError::Expired`] when the key no longer holds the
    /// token: the lock timed out and the caller was not exclusive for the
    /// whole critical section.
    pub fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        if self.store.del_if_eq(key, token) {
            debug!("Released lock {}", key);
            Ok(())
        } else {
            error!("Lock {} expired before release; work may have run without exclusivity", key);
            Err(LockError::Expired(key.to_string()))
        }
    }

    /// Acquire `key`, run `f`, and release the lock whatever `f` returned.
    ///
    /// An error from `f` wins over a release failure; a release failure after
    /// a successful `f` is returned as the result.
    pub async fn run_with_lock<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let token = self.acquire(key).await?;
        let result = f().await;
        let released = self.release(key, &token);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e),
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.store.exists(key)
    }
}
