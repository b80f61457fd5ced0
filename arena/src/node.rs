// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use grader::{GraderClient, SandboxClient};
use store::{RecordStore, StateStore};
use types::config::Parameters;

use crate::clock::Clock;
use crate::hub::SessionHub;
use crate::matchmaker::{Matchmaker, MatchmakerHandle};
use crate::supervisor::{Routes, Supervisor, SupervisorHandle};

/// One running match core: the session hub, the matchmaker and the
/// supervisor, wired together over shared routes.
///
/// Construction order matters because the components reference each
/// other: the hub is built first and late-bound to the matchmaker and
/// routing table, the supervisor learns the matchmaker handle once it
/// exists. All of that happens here, before any connection registers.
pub struct ArenaNode {
    pub clock: Arc<Clock>,
    pub params: Arc<Parameters>,
    pub hub: Arc<SessionHub>,
    pub matchmaker: MatchmakerHandle,
    pub supervisor: SupervisorHandle,
    shutdown: CancellationToken,
    supervisor_join: JoinHandle<()>,
    matchmaker_join: JoinHandle<()>,
}

impl ArenaNode {
    pub async fn start(
        params: Parameters,
        state_store: Arc<dyn StateStore>,
        records: Arc<dyn RecordStore>,
        grader: Arc<dyn GraderClient>,
        sandbox: Arc<dyn SandboxClient>,
    ) -> ArenaNode {
        let clock = Arc::new(Clock::new());
        let params = Arc::new(params);
        let shutdown = CancellationToken::new();

        let hub = Arc::new(SessionHub::new(
            clock.clone(),
            params.clone(),
            state_store.clone(),
        ));
        let routes = Routes::new();

        let (supervisor, supervisor_join) = Supervisor::start(
            clock.clone(),
            params.clone(),
            state_store.clone(),
            records,
            grader,
            sandbox,
            hub.clone(),
            routes.clone(),
            shutdown.child_token(),
        );

        let (matchmaker, matchmaker_join) = Matchmaker::start(
            clock.clone(),
            params.clone(),
            state_store,
            hub.clone(),
            supervisor.clone(),
            shutdown.child_token(),
        );

        supervisor.wire_matchmaker(matchmaker.clone()).await;
        hub.wire(matchmaker.clone(), routes);
        info!("arena node started");

        ArenaNode {
            clock,
            params,
            hub,
            matchmaker,
            supervisor,
            shutdown,
            supervisor_join,
            matchmaker_join,
        }
    }

    /// Graceful stop: every runtime broadcasts a shutdown cancellation
    /// and persists a minimal terminal record before the node returns.
    pub async fn shutdown(self) {
        info!("arena node shutting down");
        self.shutdown.cancel();
        let _ = self.supervisor_join.await;
        let _ = self.matchmaker_join.await;
    }
}
