//! In-process fast key-value store.
//!
//! Holds the hot state shared by every worker: cached document fields,
//! locks, pending update queues and the history feed. Keys carry typed
//! values (strings, lists, sets, sorted sets) and an optional expiry.
//! Expired keys are dropped lazily and behave exactly as absent keys.
//!
//! Every single-key operation is atomic: it runs under the shard lock of
//! the underlying [`DashMap`].

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Errors raised by the fast store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FastStoreError {
    #[error("key {0} holds a value of another type")]
    WrongType(String),

    #[error("value at {key} is not an integer: {value}")]
    NotAnInteger { key: String, value: String },
}

pub type FastResult<T> = Result<T, FastStoreError>;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Shared in-memory store
#[derive(Default)]
pub struct FastStore {
    entries: DashMap<String, Entry>,
    waiters: DashMap<String, Arc<Notify>>,
}

impl FastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Health probe
    pub fn ping(&self) -> bool {
        true
    }

    fn purge_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| entry.is_expired());
    }

    fn waiter(&self, key: &str) -> Arc<Notify> {
        self.waiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    pub fn get(&self, key: &str) -> FastResult<Option<String>> {
        self.purge_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Str(s) => Ok(Some(s.clone())),
                _ => Err(FastStoreError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    pub fn get_i64(&self, key: &str) -> FastResult<Option<i64>> {
        match self.get(key)? {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| FastStoreError::NotAnInteger {
                    key: key.to_string(),
                    value,
                }),
            None => Ok(None),
        }
    }

    pub fn mget(&self, keys: &[String]) -> FastResult<Vec<Option<String>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.entries
            .insert(key.to_string(), Entry::new(Value::Str(value.into())));
    }

    pub fn mset(&self, pairs: Vec<(String, String)>) {
        for (key, value) in pairs {
            self.entries.insert(key, Entry::new(Value::Str(value)));
        }
    }

    /// Set `key` only if absent. Returns whether the value was written.
    pub fn set_nx(&self, key: &str, value: impl Into<String>) -> bool {
        self.set_nx_entry(key, Entry::new(Value::Str(value.into())))
    }

    /// Set `key` with a time-to-live only if absent.
    pub fn set_nx_px(&self, key: &str, value: impl Into<String>, ttl: Duration) -> bool {
        self.set_nx_entry(
            key,
            Entry {
                value: Value::Str(value.into()),
                expires_at: Some(Instant::now() + ttl),
            },
        )
    }

    fn set_nx_entry(&self, key: &str, entry: Entry) -> bool {
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(entry);
                    true
                } else {
                    false
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    /// Replace the value and return the previous one.
    pub fn getset(&self, key: &str, value: impl Into<String>) -> FastResult<Option<String>> {
        let entry = Entry::new(Value::Str(value.into()));
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let previous = if occupied.get().is_expired() {
                    None
                } else {
                    match &occupied.get().value {
                        Value::Str(s) => Some(s.clone()),
                        _ => return Err(FastStoreError::WrongType(key.to_string())),
                    }
                };
                occupied.insert(entry);
                Ok(previous)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(None)
            }
        }
    }

    /// Remove keys, returning how many existed.
    pub fn del(&self, keys: &[String]) -> usize {
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .filter(|(_, entry)| !entry.is_expired())
            .count()
    }

    /// Remove `key` only while it still holds `expected`.
    pub fn del_if_eq(&self, key: &str, expected: &str) -> bool {
        self.entries
            .remove_if(key, |_, entry| {
                !entry.is_expired() && matches!(&entry.value, Value::Str(s) if s == expected)
            })
            .is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.purge_expired(key);
        self.entries.contains_key(key)
    }

    /// Attach a time-to-live to an existing key.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        self.purge_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    /// Append values to the tail, returning the new length.
    pub fn rpush(&self, key: &str, values: Vec<String>) -> FastResult<usize> {
        self.purge_expired(key);
        let pushed = values.len();
        let len = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
            match &mut entry.value {
                Value::List(list) => {
                    list.extend(values);
                    list.len()
                }
                _ => return Err(FastStoreError::WrongType(key.to_string())),
            }
        };

        if let Some(notify) = self.waiters.get(key) {
            for _ in 0..pushed {
                notify.notify_one();
            }
        }
        Ok(len)
    }

    /// Pop up to `count` values from the head.
    pub fn lpop_n(&self, key: &str, count: usize) -> FastResult<Vec<String>> {
        self.purge_expired(key);
        let mut drained = Vec::new();
        let now_empty = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::List(list) => {
                    let take = count.min(list.len());
                    drained.extend(list.drain(..take));
                    list.is_empty()
                }
                _ => return Err(FastStoreError::WrongType(key.to_string())),
            },
            None => return Ok(drained),
        };
        if now_empty {
            self.entries
                .remove_if(key, |_, entry| matches!(&entry.value, Value::List(l) if l.is_empty()));
        }
        Ok(drained)
    }

    /// Remove the first occurrence of `value`. Returns whether one was found.
    pub fn lrem(&self, key: &str, value: &str) -> FastResult<bool> {
        self.purge_expired(key);
        let (found, now_empty) = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::List(list) => match list.iter().position(|v| v == value) {
                    Some(idx) => {
                        list.remove(idx);
                        (true, list.is_empty())
                    }
                    None => (false, false),
                },
                _ => return Err(FastStoreError::WrongType(key.to_string())),
            },
            None => return Ok(false),
        };
        if now_empty {
            self.entries
                .remove_if(key, |_, entry| matches!(&entry.value, Value::List(l) if l.is_empty()));
        }
        Ok(found)
    }

    /// Pop head values while they equal `expected` in order, stopping at the
    /// first difference. Returns how many were removed.
    pub fn lpop_prefix(&self, key: &str, expected: &[String]) -> FastResult<usize> {
        self.purge_expired(key);
        let (removed, now_empty) = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::List(list) => {
                    let matching = list
                        .iter()
                        .zip(expected)
                        .take_while(|(have, want)| have == want)
                        .count();
                    list.drain(..matching);
                    (matching, list.is_empty())
                }
                _ => return Err(FastStoreError::WrongType(key.to_string())),
            },
            None => return Ok(0),
        };
        if now_empty {
            self.entries
                .remove_if(key, |_, entry| matches!(&entry.value, Value::List(l) if l.is_empty()));
        }
        Ok(removed)
    }

    /// Inclusive range with negative indices counting from the tail.
    pub fn lrange(&self, key: &str, start: i64, stop: i64) -> FastResult<Vec<String>> {
        self.purge_expired(key);
        let Some(entry) = self.entries.get(key) else {
            return Ok(Vec::new());
        };
        let Value::List(list) = &entry.value else {
            return Err(FastStoreError::WrongType(key.to_string()));
        };

        let len = list.len() as i64;
        let resolve = |idx: i64| if idx < 0 { len + idx } else { idx };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    pub fn llen(&self, key: &str) -> FastResult<usize> {
        self.purge_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::List(list) => Ok(list.len()),
                _ => Err(FastStoreError::WrongType(key.to_string())),
            },
            None => Ok(0),
        }
    }

    /// Keep only the last `keep` values.
    pub fn ltrim_last(&self, key: &str, keep: usize) -> FastResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                Value::List(list) => {
                    let excess = list.len().saturating_sub(keep);
                    list.drain(..excess);
                }
                _ => return Err(FastStoreError::WrongType(key.to_string())),
            }
        }
        Ok(())
    }

    /// Pop the head of `key`, waiting up to `timeout` for a value to arrive.
    pub async fn blpop(&self, key: &str, timeout: Duration) -> FastResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        let notify = self.waiter(key);
        loop {
            let notified = notify.notified();
            if let Some(value) = self.lpop_n(key, 1)?.pop() {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.lpop_n(key, 1)?.pop());
            }
        }
    }

    // ------------------------------------------------------------------
    // Sets
    // ------------------------------------------------------------------

    pub fn sadd(&self, key: &str, member: impl Into<String>) -> FastResult<bool> {
        self.purge_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.into())),
            _ => Err(FastStoreError::WrongType(key.to_string())),
        }
    }

    pub fn srem(&self, key: &str, member: &str) -> FastResult<bool> {
        let (removed, now_empty) = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::Set(set) => (set.remove(member), set.is_empty()),
                _ => return Err(FastStoreError::WrongType(key.to_string())),
            },
            None => return Ok(false),
        };
        if now_empty {
            self.entries
                .remove_if(key, |_, entry| matches!(&entry.value, Value::Set(s) if s.is_empty()));
        }
        Ok(removed)
    }

    pub fn smembers(&self, key: &str) -> FastResult<Vec<String>> {
        self.purge_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                _ => Err(FastStoreError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Sorted sets
    // ------------------------------------------------------------------

    /// Add or rescore a member. Returns whether it was new.
    pub fn zadd(&self, key: &str, score: f64, member: impl Into<String>) -> FastResult<bool> {
        self.purge_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::ZSet(HashMap::new())));
        match &mut entry.value {
            Value::ZSet(zset) => Ok(zset.insert(member.into(), score).is_none()),
            _ => Err(FastStoreError::WrongType(key.to_string())),
        }
    }

    /// Pop the lowest-scored member if its score is at most `max_score`.
    pub fn zpop_min_upto(&self, key: &str, max_score: f64) -> FastResult<Option<(String, f64)>> {
        self.purge_expired(key);
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        let Value::ZSet(zset) = &mut entry.value else {
            return Err(FastStoreError::WrongType(key.to_string()));
        };

        let lowest = zset
            .iter()
            .min_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(member, score)| (member.clone(), *score));

        match lowest {
            Some((member, score)) if score <= max_score => {
                zset.remove(&member);
                Ok(Some((member, score)))
            }
            _ => Ok(None),
        }
    }

    pub fn zcard(&self, key: &str) -> FastResult<usize> {
        self.purge_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::ZSet(zset) => Ok(zset.len()),
                _ => Err(FastStoreError::WrongType(key.to_string())),
            },
            None => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Live keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let store = FastStore::new();
        store.set("a", "1");
        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));
        assert_eq!(store.get_i64("a").unwrap(), Some(1));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_set_nx_only_writes_once() {
        let store = FastStore::new();
        assert!(store.set_nx("k", "first"));
        assert!(!store.set_nx("k", "second"));
        assert_eq!(store.get("k").unwrap(), Some("first".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = FastStore::new();
        assert!(store.set_nx_px("lock", "t1", Duration::from_millis(100)));
        assert!(!store.set_nx_px("lock", "t2", Duration::from_millis(100)));

        tokio::time::advance(Duration::from_millis(150)).await;

        assert_eq!(store.get("lock").unwrap(), None);
        assert!(store.set_nx_px("lock", "t2", Duration::from_millis(100)));
        assert!(!store.del_if_eq("lock", "t1"));
        assert!(store.del_if_eq("lock", "t2"));
    }

    #[test]
    fn test_getset_returns_previous() {
        let store = FastStore::new();
        assert_eq!(store.getset("state", "a").unwrap(), None);
        assert_eq!(store.getset("state", "b").unwrap(), Some("a".to_string()));
    }

    #[test]
    fn test_list_operations() {
        let store = FastStore::new();
        let items = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(store.rpush("l", items(&["a", "b", "c", "d"])).unwrap(), 4);
        assert_eq!(store.lrange("l", 0, -1).unwrap(), items(&["a", "b", "c", "d"]));
        assert_eq!(store.lrange("l", -2, -1).unwrap(), items(&["c", "d"]));

        store.ltrim_last("l", 3).unwrap();
        assert_eq!(store.lpop_n("l", 2).unwrap(), items(&["b", "c"]));
        assert_eq!(store.llen("l").unwrap(), 1);

        store.lpop_n("l", 5).unwrap();
        assert!(!store.exists("l"));
    }

    #[test]
    fn test_lpop_prefix_stops_at_first_difference() {
        let store = FastStore::new();
        let items = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        store.rpush("l", items(&["a", "b", "c"])).unwrap();

        assert_eq!(store.lpop_prefix("l", &items(&["a", "x"])).unwrap(), 1);
        assert_eq!(store.lrange("l", 0, -1).unwrap(), items(&["b", "c"]));

        assert_eq!(store.lpop_prefix("l", &items(&["b", "c", "d"])).unwrap(), 2);
        assert!(!store.exists("l"));
        assert_eq!(store.lpop_prefix("l", &items(&["a"])).unwrap(), 0);
    }

    #[test]
    fn test_lrem_removes_first_match() {
        let store = FastStore::new();
        let items = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        store.rpush("l", items(&["a", "b", "a"])).unwrap();

        assert!(store.lrem("l", "a").unwrap());
        assert_eq!(store.lrange("l", 0, -1).unwrap(), items(&["b", "a"]));
        assert!(!store.lrem("l", "z").unwrap());

        store.lrem("l", "b").unwrap();
        store.lrem("l", "a").unwrap();
        assert!(!store.exists("l"));
    }

    #[test]
    fn test_wrong_type() {
        let store = FastStore::new();
        store.set("s", "x");
        assert_eq!(
            store.rpush("s", vec!["y".into()]),
            Err(FastStoreError::WrongType("s".to_string()))
        );
    }

    #[tokio::test]
    async fn test_blpop_wakes_on_push() {
        let store = Arc::new(FastStore::new());
        let popper = {
            let store = store.clone();
            tokio::spawn(async move { store.blpop("queue", Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        store.rpush("queue", vec!["job".into()]).unwrap();

        assert_eq!(popper.await.unwrap().unwrap(), Some("job".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blpop_times_out() {
        let store = FastStore::new();
        let popped = store.blpop("empty", Duration::from_millis(50)).await.unwrap();
        assert_eq!(popped, None);
    }

    #[test]
    fn test_sets() {
        let store = FastStore::new();
        assert!(store.sadd("s", "a").unwrap());
        assert!(!store.sadd("s", "a").unwrap());
        store.sadd("s", "b").unwrap();

        let mut members = store.smembers("s").unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        assert!(store.srem("s", "a").unwrap());
        assert!(store.srem("s", "b").unwrap());
        assert!(!store.exists("s"));
    }

    #[test]
    fn test_sorted_set_pops_oldest_under_cutoff() {
        let store = FastStore::new();
        store.zadd("z", 30.0, "late").unwrap();
        store.zadd("z", 10.0, "early").unwrap();

        assert_eq!(store.zpop_min_upto("z", 5.0).unwrap(), None);
        assert_eq!(
            store.zpop_min_upto("z", 20.0).unwrap(),
            Some(("early".to_string(), 10.0))
        );
        assert_eq!(store.zpop_min_upto("z", 20.0).unwrap(), None);
        assert_eq!(store.zcard("z").unwrap(), 1);
    }

    #[test]
    fn test_keys_with_prefix() {
        let store = FastStore::new();
        store.set("DocVersion:{a}", "1");
        store.set("DocVersion:{b}", "2");
        store.set("Other", "3");

        let mut keys = store.keys_with_prefix("DocVersion:");
        keys.sort();
        assert_eq!(keys, vec!["DocVersion:{a}", "DocVersion:{b}"]);
    }
}
