// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! Storage interfaces of the match core.
//!
//! [`StateStore`] is the shared, externally hosted coordination store:
//! versioned snapshots with compare-and-set, pub/sub topics, the
//! time-ordered matchmaking queues and presence sets. [`RecordStore`] is
//! the durable home of problems and final match results. Both ship with
//! in-memory implementations used by a single-process deployment and by
//! every test.

mod memory;
mod record;
mod state_store;

pub use memory::MemoryStateStore;
pub use record::{MatchRecord, MemoryRecordStore, RecordError, RecordStore};
pub use state_store::{StateStore, StateStoreError, StateStoreResult, VersionedValue};

/// Key layout of the coordination store.
pub mod keys {
    use types::{MatchId, PlayerId};
    use types::mode::MatchMode;

    /// Versioned match snapshot, CAS by aggregate version.
    pub fn match_snapshot(match_id: MatchId) -> String {
        format!("match:{match_id}")
    }

    /// Process instance currently owning the match.
    pub fn match_owner(match_id: MatchId) -> String {
        format!("match:{match_id}:owner")
    }

    /// Sorted set of queued players for one mode, scored by enqueue time.
    pub fn queue(mode: MatchMode) -> String {
        format!("queue:{}", mode.as_str())
    }

    /// Custom lobby directory entry.
    pub fn custom_lobby(match_id: MatchId) -> String {
        format!("lobby:custom:{match_id}")
    }

    /// Presence record for one player.
    pub fn presence(player_id: PlayerId) -> String {
        format!("presence:{player_id}")
    }

    /// Set of players currently online on any connection.
    pub const ONLINE: &str = "presence:online";

    /// Topic carrying a match's event stream for cross-instance readers.
    pub fn match_topic(match_id: MatchId) -> String {
        format!("topic:match:{match_id}")
    }

    /// Topic carrying direct notifications for one player.
    pub fn player_topic(player_id: PlayerId) -> String {
        format!("topic:player:{player_id}")
    }
}
