//! Documents and the updates applied to them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ot::{self, Op};

/// A document as held in the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub project_id: String,
    pub doc_id: String,
    pub lines: Vec<String>,
    pub version: u64,
    pub hash: String,
    /// Tracked changes and comments; opaque to synchronization
    pub ranges: Option<Value>,
    pub pathname: String,
    pub project_history_id: Option<String>,
    /// Milliseconds since the epoch at which the cache diverged from the
    /// durable record
    pub unflushed_time: Option<i64>,
    pub last_updated_at: Option<i64>,
    pub last_updated_by: Option<String>,
}

impl Document {
    pub fn new(
        project_id: impl Into<String>,
        doc_id: impl Into<String>,
        lines: Vec<String>,
        version: u64,
    ) -> Self {
        let hash = ot::compute_hash(&lines);
        Self {
            project_id: project_id.into(),
            doc_id: doc_id.into(),
            lines,
            version,
            hash,
            ranges: None,
            pathname: String::new(),
            project_history_id: None,
            unflushed_time: None,
            last_updated_at: None,
            last_updated_by: None,
        }
    }

    pub fn with_pathname(mut self, pathname: impl Into<String>) -> Self {
        self.pathname = pathname.into();
        self
    }

    pub fn with_ranges(mut self, ranges: Option<Value>) -> Self {
        self.ranges = normalize_ranges(ranges);
        self
    }

    pub fn with_project_history_id(mut self, id: Option<String>) -> Self {
        self.project_history_id = id;
        self
    }

    pub fn is_dirty(&self) -> bool {
        self.unflushed_time.is_some()
    }

    pub fn byte_len(&self) -> usize {
        ot::joined_len(&self.lines)
    }
}

/// Empty ranges objects are stored as absent.
pub fn normalize_ranges(ranges: Option<Value>) -> Option<Value> {
    match ranges {
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(Value::Null) | None => None,
        other => other,
    }
}

/// Who made an update and through which channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

/// An op batch submitted against a base version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default = "new_update_id")]
    pub id: String,
    pub op: Vec<Op>,
    /// Version the client edited against
    pub v: u64,
    #[serde(default)]
    pub meta: UpdateMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Value>,
}

fn new_update_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Update {
    pub fn new(op: Vec<Op>, v: u64) -> Self {
        Self {
            id: new_update_id(),
            op,
            v,
            meta: UpdateMeta::default(),
            ranges: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.meta.user_id = Some(user_id.into());
        self
    }

    pub fn with_ranges(mut self, ranges: Value) -> Self {
        self.ranges = Some(ranges);
        self
    }
}
