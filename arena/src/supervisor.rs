// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! The supervisor: owner of every match runtime in this process.
//!
//! It spawns a runtime per match, records the owning instance in the
//! state store before the runtime touches it, routes mailboxes for the
//! hub, applies a per-process match cap as back-pressure on the
//! matchmaker, and watches runtime tasks so that a panic still produces a
//! best-effort cancellation broadcast and cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use grader::{GraderClient, SandboxClient};
use store::{keys, RecordStore, StateStore};
use types::base::{MatchId, PlayerId};
use types::config::Parameters;
use types::error::{ErrorCode, Reject};
use types::event::ServerEvent;
use types::match_state::{CancelReason, EndReason, MatchConfig};

use crate::clock::Clock;
use crate::hub::SessionHub;
use crate::matchmaker::{MatchmakerHandle, QueuedTicket};
use crate::runtime::{MatchCommand, MatchRuntime, RuntimeDeps};

/// Where a match came from; carries the matchmade tickets so the runtime
/// can seed its roster and requeue on failed confirmation.
pub enum MatchOrigin {
    Matchmade { tickets: Vec<QueuedTicket> },
    Custom,
}

pub struct CreateMatch {
    pub config: MatchConfig,
    pub owner: Option<PlayerId>,
    pub origin: MatchOrigin,
}

/// Shared `match_id -> mailbox` table. The hub reads it on every routed
/// command; the supervisor is the only writer.
#[derive(Clone, Default)]
pub struct Routes {
    inner: Arc<RwLock<HashMap<MatchId, mpsc::Sender<MatchCommand>>>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, match_id: MatchId) -> Option<mpsc::Sender<MatchCommand>> {
        self.inner.read().get(&match_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn insert(&self, match_id: MatchId, mailbox: mpsc::Sender<MatchCommand>) {
        self.inner.write().insert(match_id, mailbox);
    }

    fn remove(&self, match_id: MatchId) {
        self.inner.write().remove(&match_id);
    }
}

enum SupervisorCommand {
    Create {
        request: CreateMatch,
        reply: oneshot::Sender<Result<MatchId, Reject>>,
    },
    /// Late wiring of the matchmaker handle, once during node startup.
    Wire {
        matchmaker: MatchmakerHandle,
    },
    Finished {
        match_id: MatchId,
    },
}

#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    /// A handle with no supervisor behind it, for unit fixtures.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    pub async fn create_match(&self, request: CreateMatch) -> Result<MatchId, Reject> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SupervisorCommand::Create { request, reply })
            .await
            .is_err()
        {
            return Err(Reject::new(ErrorCode::Internal, "supervisor is down"));
        }
        rx.await
            .unwrap_or_else(|_| Err(Reject::new(ErrorCode::Internal, "supervisor is down")))
    }

    pub async fn wire_matchmaker(&self, matchmaker: MatchmakerHandle) {
        let _ = self.tx.send(SupervisorCommand::Wire { matchmaker }).await;
    }
}

pub struct Supervisor {
    clock: Arc<Clock>,
    params: Arc<Parameters>,
    state_store: Arc<dyn StateStore>,
    records: Arc<dyn RecordStore>,
    grader: Arc<dyn GraderClient>,
    sandbox: Arc<dyn SandboxClient>,
    hub: Arc<SessionHub>,
    routes: Routes,
    matchmaker: Option<MatchmakerHandle>,
    instance_id: String,
    live: HashMap<MatchId, JoinHandle<()>>,
    handle_tx: mpsc::Sender<SupervisorCommand>,
    rx: mpsc::Receiver<SupervisorCommand>,
    shutdown: CancellationToken,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        clock: Arc<Clock>,
        params: Arc<Parameters>,
        state_store: Arc<dyn StateStore>,
        records: Arc<dyn RecordStore>,
        grader: Arc<dyn GraderClient>,
        sandbox: Arc<dyn SandboxClient>,
        hub: Arc<SessionHub>,
        routes: Routes,
        shutdown: CancellationToken,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(params.mailbox_capacity);
        let instance_id = format!("arena-{}", uuid::Uuid::new_v4().simple());
        let supervisor = Supervisor {
            clock,
            params,
            state_store,
            records,
            grader,
            sandbox,
            hub,
            routes,
            matchmaker: None,
            instance_id,
            live: HashMap::new(),
            handle_tx: tx.clone(),
            rx,
            shutdown,
        };
        let join = tokio::spawn(supervisor.run());
        (SupervisorHandle { tx }, join)
    }

    async fn run(mut self) {
        info!(instance = %self.instance_id, "supervisor started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        self.drain().await;
        info!(instance = %self.instance_id, "supervisor stopped");
    }

    async fn handle(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Create { request, reply } => {
                let _ = reply.send(self.create(request).await);
            }
            SupervisorCommand::Wire { matchmaker } => {
                self.matchmaker = Some(matchmaker);
            }
            SupervisorCommand::Finished { match_id } => {
                self.routes.remove(match_id);
                self.live.remove(&match_id);
            }
        }
    }

    async fn create(&mut self, request: CreateMatch) -> Result<MatchId, Reject> {
        if self.live.len() >= self.params.max_live_matches {
            return Err(Reject::new(
                ErrorCode::CapacityExhausted,
                "this instance is at its match capacity",
            ));
        }
        let match_id = MatchId::generate();

        // Claim ownership before the runtime writes anything, so a
        // concurrently routing hub on another instance can resolve us.
        self.state_store
            .cas_set(
                &keys::match_owner(match_id),
                None,
                serde_json::json!(self.instance_id),
            )
            .await
            .map_err(|err| {
                warn!(%match_id, "claiming match ownership failed: {err}");
                Reject::new(ErrorCode::Internal, "match allocation failed")
            })?;

        let deps = RuntimeDeps {
            clock: self.clock.clone(),
            params: self.params.clone(),
            state_store: self.state_store.clone(),
            records: self.records.clone(),
            grader: self.grader.clone(),
            sandbox: self.sandbox.clone(),
            hub: self.hub.clone(),
            matchmaker: self
                .matchmaker
                .clone()
                .unwrap_or_else(MatchmakerHandle::disconnected),
        };
        let (mailbox, join) = MatchRuntime::spawn(
            deps,
            match_id,
            request.config,
            request.owner,
            request.origin,
            self.shutdown.child_token(),
        );
        self.routes.insert(match_id, mailbox);
        self.live.insert(match_id, self.watch(match_id, join));
        info!(%match_id, live = self.live.len(), "match runtime spawned");
        Ok(match_id)
    }

    /// Wrap a runtime join handle so that a panic still cleans up after
    /// the match.
    fn watch(&self, match_id: MatchId, join: JoinHandle<()>) -> JoinHandle<()> {
        let hub = self.hub.clone();
        let state_store = self.state_store.clone();
        let notify = self.handle_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = join.await {
                if err.is_panic() {
                    warn!(%match_id, "match runtime panicked; broadcasting cancellation");
                    hub.broadcast(match_id, ServerEvent::MatchEnd {
                        match_id,
                        version: u64::MAX,
                        standings: Vec::new(),
                        reason: EndReason::Cancelled {
                            reason: CancelReason::Internal,
                        },
                    });
                    hub.close_room(match_id);
                    let _ = state_store.remove(&keys::match_snapshot(match_id)).await;
                    let _ = state_store.remove(&keys::match_owner(match_id)).await;
                }
            }
            let _ = notify.send(SupervisorCommand::Finished { match_id }).await;
        })
    }

    /// Graceful shutdown: every runtime saw the cancellation token; give
    /// them a bounded window to broadcast and persist their terminal
    /// records.
    async fn drain(&mut self) {
        if self.live.is_empty() {
            return;
        }
        info!(live = self.live.len(), "draining match runtimes");
        let joins: Vec<JoinHandle<()>> = self.live.drain().map(|(_, j)| j).collect();
        let drain = futures::future::join_all(joins);
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            warn!("some match runtimes did not drain in time");
        }
    }
}
