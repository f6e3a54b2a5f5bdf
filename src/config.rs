use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::lock::LockConfig;
use crate::service::ServiceConfig;
use crate::storage::StorageConfig;
use crate::sync::{DispatchConfig, FlushConfig, SyncConfig};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid {name} environment variable: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3003)
    pub port: u16,
    /// Sled database path (default: ./data/docsync.sled)
    pub storage_path: String,
    /// Base URL of the history service; history is discarded when unset
    pub history_url: Option<String>,
    pub worker_count: usize,
    pub lock_ttl: Duration,
    pub lock_max_wait: Duration,
    pub lock_poll_interval: Duration,
    pub lock_max_retries: u32,
    pub flush_interval: Duration,
    pub max_unflushed_age: Duration,
    pub idle_eviction: Duration,
    pub deferred_delete_min_age: Duration,
    pub flush_max_retries: u32,
    pub flush_retry_base: Duration,
    pub history_flush_every_n_ops: usize,
    pub max_doc_length: usize,
    pub max_pending_updates: usize,
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => {
            let parsed = value.trim().parse().ok();
            parsed.ok_or(ConfigError::Invalid { name, value })
        }
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secs = |name: &'static str, default: u64| {
            parse_var(&lookup, name, default).map(Duration::from_secs)
        };
        let millis = |name: &'static str, default: u64| {
            parse_var(&lookup, name, default).map(Duration::from_millis)
        };

        Ok(Config {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_var(&lookup, "PORT", 3003)?,
            storage_path: lookup("STORAGE_PATH")
                .unwrap_or_else(|| "./data/docsync.sled".to_string()),
            history_url: lookup("HISTORY_URL").filter(|url| !url.trim().is_empty()),
            worker_count: parse_var(&lookup, "WORKER_COUNT", 4)?,
            lock_ttl: secs("LOCK_TTL_SECS", 30)?,
            lock_max_wait: millis("LOCK_MAX_WAIT_MS", 10_000)?,
            lock_poll_interval: millis("LOCK_POLL_INTERVAL_MS", 50)?,
            lock_max_retries: parse_var(&lookup, "LOCK_MAX_RETRIES", 3)?,
            flush_interval: secs("FLUSH_INTERVAL_SECS", 30)?,
            max_unflushed_age: secs("MAX_UNFLUSHED_AGE_SECS", 300)?,
            idle_eviction: secs("IDLE_EVICTION_SECS", 3600)?,
            deferred_delete_min_age: secs("DEFERRED_DELETE_MIN_AGE_SECS", 300)?,
            flush_max_retries: parse_var(&lookup, "FLUSH_MAX_RETRIES", 3)?,
            flush_retry_base: millis("FLUSH_RETRY_BASE_MS", 100)?,
            history_flush_every_n_ops: parse_var(&lookup, "HISTORY_FLUSH_EVERY_N_OPS", 500)?,
            max_doc_length: parse_var(&lookup, "MAX_DOC_LENGTH", 2 * 1024 * 1024)?,
            max_pending_updates: parse_var(&lookup, "MAX_PENDING_UPDATES", 1000)?,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig::new(self.storage_path.clone())
    }

    pub fn service(&self) -> ServiceConfig {
        ServiceConfig::default()
            .with_lock(
                LockConfig::default()
                    .with_ttl(self.lock_ttl)
                    .with_max_wait(self.lock_max_wait)
                    .with_poll_interval(self.lock_poll_interval),
            )
            .with_sync(
                SyncConfig::default()
                    .with_max_doc_length(self.max_doc_length)
                    .with_history_flush_threshold(self.history_flush_every_n_ops)
                    .with_max_unflushed_age(self.max_unflushed_age)
                    .with_flush_retries(self.flush_max_retries, self.flush_retry_base),
            )
            .with_dispatch(
                DispatchConfig::default()
                    .with_workers(self.worker_count)
                    .with_max_pending_updates(self.max_pending_updates)
                    .with_max_lock_retries(self.lock_max_retries),
            )
            .with_flush(
                FlushConfig::default()
                    .with_sweep_interval(self.flush_interval)
                    .with_idle_eviction_timeout(self.idle_eviction)
                    .with_deferred_delete_min_age(self.deferred_delete_min_age),
            )
    }
}
