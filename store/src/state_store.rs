// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use types::Version;

/// A value together with the version it was written at.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedValue {
    pub version: Version,
    pub value: Value,
}

#[derive(Clone, Debug, Error)]
pub enum StateStoreError {
    /// Transient failure; callers retry with capped backoff.
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    /// The conditional write lost. Never retried blindly: for match
    /// snapshots it means another instance owns the aggregate.
    #[error("compare-and-set conflict on {key}: expected {expected:?}, found {found:?}")]
    CasConflict {
        key: String,
        expected: Option<Version>,
        found: Option<Version>,
    },
}

impl StateStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateStoreError::CasConflict { .. })
    }
}

pub type StateStoreResult<T> = Result<T, StateStoreError>;

/// Shared coordination store. All methods may fail transiently; only
/// `cas_set` can fail with a conflict.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StateStoreResult<Option<VersionedValue>>;

    /// Conditional write. `expected = None` creates the key only if it is
    /// absent; `expected = Some(v)` requires the stored version to be
    /// exactly `v`. Returns the new version.
    async fn cas_set(
        &self,
        key: &str,
        expected: Option<Version>,
        value: Value,
    ) -> StateStoreResult<Version>;

    async fn remove(&self, key: &str) -> StateStoreResult<()>;

    async fn publish(&self, topic: &str, payload: Value) -> StateStoreResult<()>;

    /// Subscribe to a topic. Lagging subscribers miss events rather than
    /// blocking publishers; a reader that detects a version gap resyncs.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value>;

    // -- sorted sets (matchmaking queues, scored by enqueue time) --------

    async fn zadd(&self, key: &str, score: u64, member: &str) -> StateStoreResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> StateStoreResult<bool>;

    /// The `limit` lowest-scored members in ascending score order.
    async fn zrange_head(&self, key: &str, limit: usize) -> StateStoreResult<Vec<(u64, String)>>;

    /// Atomically pop the lowest-scored member satisfying the predicate.
    async fn zpop_min_if(
        &self,
        key: &str,
        predicate: &(dyn for<'a> Fn(u64, &'a str) -> bool + Send + Sync),
    ) -> StateStoreResult<Option<(u64, String)>>;

    // -- plain sets (presence) -------------------------------------------

    async fn sadd(&self, key: &str, member: &str) -> StateStoreResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> StateStoreResult<bool>;

    async fn smembers(&self, key: &str) -> StateStoreResult<Vec<String>>;
}
