// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use types::Version;

use crate::state_store::{StateStore, StateStoreError, StateStoreResult, VersionedValue};

const TOPIC_CAPACITY: usize = 256;

/// In-memory [`StateStore`] for single-process deployments and tests.
///
/// A single coarse mutex is deliberate: every operation is a handful of
/// map lookups, and coarseness is what makes `zpop_min_if` atomic.
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, VersionedValue>,
    zsets: HashMap<String, BTreeMap<(u64, String), ()>>,
    sets: HashMap<String, HashSet<String>>,
    topics: HashMap<String, broadcast::Sender<Value>>,
    /// Failure injection: how many upcoming calls report `Unavailable`.
    fail_budget: u32,
    /// Failure injection: force the next `cas_set` to conflict.
    conflict_next_cas: bool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make the next `n` store operations fail transiently.
    pub fn fail_next(&self, n: u32) {
        self.inner.lock().fail_budget = n;
    }

    /// Make the next snapshot write lose its compare-and-set.
    pub fn conflict_next_cas(&self) {
        self.inner.lock().conflict_next_cas = true;
    }

    fn topic_sender(inner: &mut Inner, topic: &str) -> broadcast::Sender<Value> {
        inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_available(inner: &mut Inner) -> StateStoreResult<()> {
    if inner.fail_budget > 0 {
        inner.fail_budget -= 1;
        return Err(StateStoreError::Unavailable("injected failure".to_string()));
    }
    Ok(())
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StateStoreResult<Option<VersionedValue>> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        Ok(inner.kv.get(key).cloned())
    }

    async fn cas_set(
        &self,
        key: &str,
        expected: Option<Version>,
        value: Value,
    ) -> StateStoreResult<Version> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        let found = inner.kv.get(key).map(|v| v.version);
        if std::mem::take(&mut inner.conflict_next_cas) || found != expected {
            return Err(StateStoreError::CasConflict {
                key: key.to_string(),
                expected,
                found,
            });
        }
        let version = expected.map_or(1, |v| v + 1);
        inner
            .kv
            .insert(key.to_string(), VersionedValue { version, value });
        Ok(version)
    }

    async fn remove(&self, key: &str) -> StateStoreResult<()> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        inner.kv.remove(key);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Value) -> StateStoreResult<()> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        // A send error only means nobody is listening.
        let _ = Self::topic_sender(&mut inner, topic).send(payload);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        let mut inner = self.inner.lock();
        Self::topic_sender(&mut inner, topic).subscribe()
    }

    async fn zadd(&self, key: &str, score: u64, member: &str) -> StateStoreResult<()> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert((score, member.to_string()), ());
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StateStoreResult<bool> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let entry = zset.keys().find(|(_, m)| m == member).cloned();
        Ok(match entry {
            Some(entry) => zset.remove(&entry).is_some(),
            None => false,
        })
    }

    async fn zrange_head(&self, key: &str, limit: usize) -> StateStoreResult<Vec<(u64, String)>> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        Ok(inner
            .zsets
            .get(key)
            .map(|zset| zset.keys().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn zpop_min_if(
        &self,
        key: &str,
        predicate: &(dyn for<'a> Fn(u64, &'a str) -> bool + Send + Sync),
    ) -> StateStoreResult<Option<(u64, String)>> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(None);
        };
        let mut hit: Option<(u64, String)> = None;
        for (score, member) in zset.keys() {
            if predicate(*score, member) {
                hit = Some((*score, member.clone()));
                break;
            }
        }
        if let Some(entry) = hit {
            zset.remove(&entry);
            return Ok(Some(entry));
        }
        Ok(None)
    }

    async fn sadd(&self, key: &str, member: &str) -> StateStoreResult<bool> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> StateStoreResult<bool> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        Ok(inner
            .sets
            .get_mut(key)
            .map(|set| set.remove(member))
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> StateStoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        check_available(&mut inner)?;
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
