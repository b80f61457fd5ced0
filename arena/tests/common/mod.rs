// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixture for the end-to-end tests: a full arena node over
//! in-memory stores, a scripted grader/sandbox pair and lightweight
//! clients speaking through the session hub.

use std::sync::Arc;

use tokio::sync::mpsc;

use arena::{outbound_channel, ArenaNode};
use grader::{MockGrader, MockSandbox};
use store::{MemoryRecordStore, MemoryStateStore};
use types::base::{ConnectionId, MatchId, Version};
use types::command::ClientCommand;
use types::config::Parameters;
use types::event::ServerEvent;
use types::player::PlayerProfile;
use types::problem::{Difficulty, Problem};

pub struct TestArena {
    pub node: ArenaNode,
    pub state: Arc<MemoryStateStore>,
    pub records: Arc<MemoryRecordStore>,
    pub grader: Arc<MockGrader>,
    pub sandbox: Arc<MockSandbox>,
}

impl TestArena {
    pub async fn start(params: Parameters) -> TestArena {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init()
            .ok();

        let state = Arc::new(MemoryStateStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        for i in 0..4 {
            records.seed_problem(Problem {
                problem_id: format!("problem-{i}").as_str().into(),
                title: format!("Problem {i}"),
                statement: "Write a function that solves the task.".to_string(),
                difficulty: Difficulty::Medium,
                example: None,
                reference: None,
            });
        }
        let grader = Arc::new(MockGrader::new());
        let sandbox = Arc::new(MockSandbox::new());

        let node = ArenaNode::start(
            params,
            state.clone(),
            records.clone(),
            grader.clone(),
            sandbox.clone(),
        )
        .await;
        TestArena {
            node,
            state,
            records,
            grader,
            sandbox,
        }
    }

    pub async fn connect(&self, name: &str, rating: u32) -> Client {
        self.connect_as(PlayerProfile::new(name, rating)).await
    }

    /// Register a connection for an existing identity (reconnection).
    pub async fn connect_as(&self, profile: PlayerProfile) -> Client {
        let (tx, rx) = outbound_channel();
        let conn = self.node.hub.register(profile.clone(), tx).await;
        settle().await;
        Client {
            arena_hub: self.node.hub.clone(),
            conn,
            profile,
            rx,
            versions: Vec::new(),
        }
    }
}

pub struct Client {
    arena_hub: Arc<arena::SessionHub>,
    pub conn: ConnectionId,
    pub profile: PlayerProfile,
    rx: mpsc::Receiver<ServerEvent>,
    versions: Vec<(MatchId, Version)>,
}

impl Client {
    pub async fn send(&self, command: ClientCommand) {
        self.arena_hub.handle_command(self.conn, command).await;
        settle().await;
    }

    pub async fn disconnect(&self) {
        self.arena_hub.disconnect(self.conn).await;
        settle().await;
    }

    fn try_pop(&mut self) -> Option<ServerEvent> {
        let event = self.rx.try_recv().ok()?;
        if let Some(version) = event.version() {
            if let Some(match_id) = event_match_id(&event) {
                self.versions.push((match_id, version));
            }
        }
        Some(event)
    }

    /// Pop every already-delivered event.
    pub async fn drain(&mut self) -> Vec<ServerEvent> {
        settle().await;
        let mut events = Vec::new();
        while let Some(event) = self.try_pop() {
            events.push(event);
        }
        events
    }

    /// Wait (by yielding, never by sleeping) until an event matching the
    /// extractor arrives; panics when the system quiesces without one.
    pub async fn expect<T>(&mut self, what: &str, f: impl Fn(ServerEvent) -> Option<T>) -> T {
        for _ in 0..100 {
            settle().await;
            while let Some(event) = self.try_pop() {
                if let Some(value) = f(event) {
                    return value;
                }
            }
        }
        panic!("{}: expected event never arrived", what);
    }

    /// Versions observed on match-scoped events, in arrival order. The
    /// runtime guarantees these are strictly increasing per match for a
    /// single connection.
    pub fn assert_versions_strictly_increasing(&self, match_id: MatchId) {
        let versions: Vec<Version> = self
            .versions
            .iter()
            .filter(|(m, _)| *m == match_id)
            .map(|(_, v)| *v)
            .collect();
        assert!(
            versions.windows(2).all(|w| w[0] < w[1]),
            "versions not strictly increasing: {versions:?}"
        );
    }
}

fn event_match_id(event: &ServerEvent) -> Option<MatchId> {
    match event {
        ServerEvent::PlayerJoined { match_id, .. }
        | ServerEvent::PlayerLeft { match_id, .. }
        | ServerEvent::MatchStarting { match_id, .. }
        | ServerEvent::RoundStart { match_id, .. }
        | ServerEvent::SubmissionAck { match_id, .. }
        | ServerEvent::PlayerSubmitted { match_id, .. }
        | ServerEvent::RoundResult { match_id, .. }
        | ServerEvent::MatchEnd { match_id, .. } => Some(*match_id),
        ServerEvent::Resync { snapshot } => Some(snapshot.match_id),
        _ => None,
    }
}

/// Let every actor in the node drain its mailbox without advancing the
/// paused clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Advance virtual time and let timer-driven work complete.
pub async fn advance_and_settle(duration: std::time::Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}
