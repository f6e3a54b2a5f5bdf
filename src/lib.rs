//! Collaborative document synchronization server.
//!
//! Clients submit op batches against a document version. Updates to a
//! document are serialized by a lock in the fast store, applied with the
//! operational transform engine, kept in the document cache, and written
//! back to durable storage by the flush manager. Every applied change is
//! also queued for the downstream history service.

pub mod cache;
pub mod config;
pub mod document;
pub mod fast;
pub mod history;
pub mod http;
pub mod lock;
pub mod ot;
pub mod service;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use service::{DocSync, ServiceConfig};
