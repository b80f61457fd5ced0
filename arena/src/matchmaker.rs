// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! The matchmaking actor: FIFO queues per mode, rating-width pairing,
//! multi-seat fill deadlines and the custom lobby directory.
//!
//! One long-running task owns all queue state; every caller goes through
//! [`MatchmakerHandle`]. Queue entries live in the state store as sorted
//! sets scored by enqueue time, so another instance can inspect them; the
//! local ticket map carries the profiles needed to build a match.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use store::{keys, StateStore};
use types::base::{MatchId, PlayerId, Rating, TimestampMs};
use types::command::{CustomGameOptions, MatchPreferences};
use types::config::Parameters;
use types::error::{ErrorCode, Reject};
use types::event::ServerEvent;
use types::match_state::MatchConfig;
use types::mode::MatchMode;
use types::player::PlayerProfile;

use crate::clock::Clock;
use crate::hub::SessionHub;
use crate::supervisor::{CreateMatch, MatchOrigin, SupervisorHandle};

/// A queued player, as carried into a match and back on requeue.
#[derive(Clone, Debug)]
pub struct QueuedTicket {
    pub profile: PlayerProfile,
    pub mode: MatchMode,
    pub preferences: MatchPreferences,
    pub enqueued_at: TimestampMs,
}

enum MmCommand {
    Enqueue {
        profile: PlayerProfile,
        mode: MatchMode,
        preferences: MatchPreferences,
        reply: oneshot::Sender<Result<usize, Reject>>,
    },
    Cancel {
        player_id: PlayerId,
        reply: oneshot::Sender<bool>,
    },
    CreateCustom {
        owner: PlayerProfile,
        options: CustomGameOptions,
        reply: oneshot::Sender<Result<MatchId, Reject>>,
    },
    /// Tickets returning after a failed pairing confirmation; original
    /// enqueue times put them back at the head.
    Requeue {
        tickets: Vec<QueuedTicket>,
    },
    PlayerDisconnected {
        player_id: PlayerId,
    },
    QueueDepth {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct MatchmakerHandle {
    tx: mpsc::Sender<MmCommand>,
}

impl MatchmakerHandle {
    /// A handle with no actor behind it; every call degrades gracefully.
    /// Used in tests of components that never reach the matchmaker.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    pub async fn enqueue(
        &self,
        profile: PlayerProfile,
        mode: MatchMode,
        preferences: MatchPreferences,
    ) -> Result<usize, Reject> {
        let (reply, rx) = oneshot::channel();
        let command = MmCommand::Enqueue {
            profile,
            mode,
            preferences,
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return Err(Reject::new(ErrorCode::Internal, "matchmaker is down"));
        }
        rx.await
            .unwrap_or_else(|_| Err(Reject::new(ErrorCode::Internal, "matchmaker is down")))
    }

    /// Idempotent: returns false when the player was not queued (already
    /// paired or never enqueued).
    pub async fn cancel(&self, player_id: PlayerId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(MmCommand::Cancel { player_id, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn create_custom(
        &self,
        owner: PlayerProfile,
        options: CustomGameOptions,
    ) -> Result<MatchId, Reject> {
        let (reply, rx) = oneshot::channel();
        let command = MmCommand::CreateCustom {
            owner,
            options,
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return Err(Reject::new(ErrorCode::Internal, "matchmaker is down"));
        }
        rx.await
            .unwrap_or_else(|_| Err(Reject::new(ErrorCode::Internal, "matchmaker is down")))
    }

    pub async fn requeue_front(&self, tickets: Vec<QueuedTicket>) {
        let _ = self.tx.send(MmCommand::Requeue { tickets }).await;
    }

    pub async fn player_disconnected(&self, player_id: PlayerId) {
        let _ = self.tx.send(MmCommand::PlayerDisconnected { player_id }).await;
    }

    pub async fn queue_depth(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(MmCommand::QueueDepth { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub struct Matchmaker {
    clock: Arc<Clock>,
    params: Arc<Parameters>,
    state: Arc<dyn StateStore>,
    hub: Arc<SessionHub>,
    supervisor: SupervisorHandle,
    tickets: HashMap<PlayerId, QueuedTicket>,
    rx: mpsc::Receiver<MmCommand>,
    shutdown: CancellationToken,
}

impl Matchmaker {
    pub fn start(
        clock: Arc<Clock>,
        params: Arc<Parameters>,
        state: Arc<dyn StateStore>,
        hub: Arc<SessionHub>,
        supervisor: SupervisorHandle,
        shutdown: CancellationToken,
    ) -> (MatchmakerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(params.mailbox_capacity);
        let matchmaker = Matchmaker {
            clock,
            params,
            state,
            hub,
            supervisor,
            tickets: HashMap::new(),
            rx,
            shutdown,
        };
        let join = tokio::spawn(matchmaker.run());
        (MatchmakerHandle { tx }, join)
    }

    async fn run(mut self) {
        info!("matchmaker started");
        let mut sweep = tokio::time::interval(self.params.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep().await,
            }
        }
        info!("matchmaker stopped");
    }

    async fn handle(&mut self, command: MmCommand) {
        match command {
            MmCommand::Enqueue {
                profile,
                mode,
                preferences,
                reply,
            } => {
                let result = self.enqueue(profile, mode, preferences).await;
                let _ = reply.send(result);
                self.pair_mode(mode).await;
            }
            MmCommand::Cancel { player_id, reply } => {
                let _ = reply.send(self.remove_ticket(player_id).await);
            }
            MmCommand::CreateCustom {
                owner,
                options,
                reply,
            } => {
                let _ = reply.send(self.create_custom(owner, options).await);
            }
            MmCommand::Requeue { tickets } => {
                for ticket in tickets {
                    let key = keys::queue(ticket.mode);
                    let member = ticket.profile.player_id.to_string();
                    if let Err(err) = self.state.zadd(&key, ticket.enqueued_at, &member).await {
                        warn!(player = %ticket.profile.player_id, "requeue failed: {err}");
                        continue;
                    }
                    self.tickets.insert(ticket.profile.player_id, ticket);
                }
            }
            MmCommand::PlayerDisconnected { player_id } => {
                if self.remove_ticket(player_id).await {
                    debug!(%player_id, "ticket cancelled on disconnect");
                }
            }
            MmCommand::QueueDepth { reply } => {
                let _ = reply.send(self.tickets.len());
            }
        }
    }

    async fn enqueue(
        &mut self,
        profile: PlayerProfile,
        mode: MatchMode,
        preferences: MatchPreferences,
    ) -> Result<usize, Reject> {
        if !mode.is_matchmade() {
            return Err(Reject::new(
                ErrorCode::InvalidMode,
                "custom lobbies are joined by id, not queued",
            ));
        }
        if self.tickets.contains_key(&profile.player_id) {
            return Err(Reject::new(ErrorCode::InvalidCommand, "already queued"));
        }
        let enqueued_at = self.clock.timestamp_ms();
        let member = profile.player_id.to_string();
        self.state
            .zadd(&keys::queue(mode), enqueued_at, &member)
            .await
            .map_err(|err| {
                warn!("enqueue failed: {err}");
                Reject::new(ErrorCode::Internal, "matchmaking unavailable")
            })?;
        let player_id = profile.player_id;
        self.tickets.insert(
            player_id,
            QueuedTicket {
                profile,
                mode,
                preferences,
                enqueued_at,
            },
        );
        let position = self.tickets.values().filter(|t| t.mode == mode).count();
        Ok(position)
    }

    async fn remove_ticket(&mut self, player_id: PlayerId) -> bool {
        let Some(ticket) = self.tickets.remove(&player_id) else {
            return false;
        };
        match self
            .state
            .zrem(&keys::queue(ticket.mode), &player_id.to_string())
            .await
        {
            Ok(removed) => removed,
            Err(err) => {
                warn!(%player_id, "zrem failed, queue entry may linger: {err}");
                true
            }
        }
    }

    async fn create_custom(
        &mut self,
        owner: PlayerProfile,
        options: CustomGameOptions,
    ) -> Result<MatchId, Reject> {
        let config = self.custom_config(options);
        let request = CreateMatch {
            config,
            owner: Some(owner.player_id),
            origin: MatchOrigin::Custom,
        };
        let match_id = self.supervisor.create_match(request).await?;

        let lobby = serde_json::json!({
            "owner": owner.player_id.to_string(),
            "owner_name": owner.display_name,
            "created_at": self.clock.timestamp_ms(),
        });
        if let Err(err) = self
            .state
            .cas_set(&keys::custom_lobby(match_id), None, lobby)
            .await
        {
            debug!(%match_id, "lobby directory write failed: {err}");
        }
        info!(%match_id, owner = %owner.player_id, "custom lobby created");
        Ok(match_id)
    }

    fn custom_config(&self, options: CustomGameOptions) -> MatchConfig {
        let mut config =
            MatchConfig::for_mode(MatchMode::Custom, self.params.language_whitelist.clone());
        if let Some(max_players) = options.max_players {
            config.max_players = max_players.clamp(2, self.params.custom_max_players);
        }
        if let Some(round_count) = options.round_count {
            config.round_count = round_count.clamp(1, self.params.custom_max_rounds);
        }
        if let Some(secs) = options.round_time_limit_s {
            let limit = Duration::from_secs(secs.max(10));
            config.round_time_limit = limit.min(self.params.custom_max_round_time);
        }
        if let Some(private) = options.is_private {
            config.is_private = private;
        }
        if let Some(allow) = options.allow_spectators {
            config.allow_spectators = allow;
        }
        if let Some(whitelist) = options.language_whitelist {
            let allowed: Vec<String> = whitelist
                .into_iter()
                .map(|l| l.to_lowercase())
                .filter(|l| self.params.language_whitelist.contains(l))
                .collect();
            if !allowed.is_empty() {
                config.language_whitelist = allowed;
            }
        }
        config.invited = options.invited;
        config
    }

    // ---- pairing --------------------------------------------------------

    /// Allowed rating gap after waiting this long. Starts at the initial
    /// width, widens stepwise, and never grows past the cap.
    fn width_at(&self, waited: Duration) -> Rating {
        let interval = self.params.rating_widen_interval.as_millis().max(1);
        let steps = (waited.as_millis() / interval) as u32;
        if steps == 0 {
            self.params.initial_rating_width
        } else {
            self.params
                .max_rating_width
                .min(self.params.rating_widen_step.saturating_mul(steps))
        }
    }

    async fn sweep(&mut self) {
        let modes: Vec<MatchMode> = {
            let mut modes: Vec<MatchMode> = self.tickets.values().map(|t| t.mode).collect();
            modes.sort_by_key(|m| m.as_str());
            modes.dedup();
            modes
        };
        for mode in modes {
            self.pair_mode(mode).await;
        }
    }

    async fn pair_mode(&mut self, mode: MatchMode) {
        if !mode.is_matchmade() {
            return;
        }
        let profile = mode.profile();
        loop {
            let group = match self.next_group(mode, profile.max_players).await {
                Some(group) => group,
                None => break,
            };
            if !self.claim_group(mode, &group).await {
                continue;
            }
            if !self.launch(mode, group).await {
                break;
            }
        }
    }

    /// Pick the next compatible group by queue order, or None when the
    /// queue cannot produce one yet.
    async fn next_group(&mut self, mode: MatchMode, seats: usize) -> Option<Vec<QueuedTicket>> {
        let key = keys::queue(mode);
        let head = match self.state.zrange_head(&key, 64).await {
            Ok(head) => head,
            Err(err) => {
                warn!("queue read failed: {err}");
                return None;
            }
        };
        let mut queued: Vec<QueuedTicket> = Vec::new();
        for (_, member) in &head {
            let Ok(player_id) = member.parse::<PlayerId>() else {
                continue;
            };
            match self.tickets.get(&player_id) {
                Some(ticket) => queued.push(ticket.clone()),
                None => {
                    // Stale entry from a lost instance; drop it.
                    let _ = self.state.zrem(&key, member).await;
                }
            }
        }

        let now = self.clock.timestamp_ms();
        let waited = |t: &QueuedTicket| Duration::from_millis(now.saturating_sub(t.enqueued_at));

        match seats {
            1 => queued.first().map(|t| vec![t.clone()]),
            2 => {
                for (i, a) in queued.iter().enumerate() {
                    for b in queued.iter().skip(i + 1) {
                        let gap = a.profile.rating.abs_diff(b.profile.rating);
                        let width = self.width_at(waited(a).max(waited(b)));
                        if gap < width {
                            return Some(vec![a.clone(), b.clone()]);
                        }
                    }
                }
                None
            }
            _ => {
                if queued.len() >= seats {
                    Some(queued.into_iter().take(seats).collect())
                } else if queued.len() >= 2
                    && queued
                        .first()
                        .is_some_and(|oldest| waited(oldest) >= self.params.fill_deadline)
                {
                    // Fill deadline passed: start with the largest group.
                    Some(queued)
                } else {
                    None
                }
            }
        }
    }

    /// Atomically pop every member of the group from the queue. On any
    /// miss the popped ones are put back untouched.
    async fn claim_group(&mut self, mode: MatchMode, group: &[QueuedTicket]) -> bool {
        let key = keys::queue(mode);
        let mut claimed: Vec<&QueuedTicket> = Vec::new();
        for ticket in group {
            let member = ticket.profile.player_id.to_string();
            let popped = self
                .state
                .zpop_min_if(&key, &move |_, m| m == member)
                .await;
            match popped {
                Ok(Some(_)) => claimed.push(ticket),
                _ => {
                    for t in &claimed {
                        let _ = self
                            .state
                            .zadd(&key, t.enqueued_at, &t.profile.player_id.to_string())
                            .await;
                    }
                    return false;
                }
            }
        }
        for ticket in group {
            self.tickets.remove(&ticket.profile.player_id);
        }
        true
    }

    /// Create the match and notify the players. Returns false when the
    /// supervisor pushed back; the group is requeued untouched.
    async fn launch(&mut self, mode: MatchMode, group: Vec<QueuedTicket>) -> bool {
        let players: Vec<PlayerProfile> = group.iter().map(|t| t.profile.clone()).collect();
        let request = CreateMatch {
            config: MatchConfig::for_mode(mode, self.params.language_whitelist.clone()),
            owner: None,
            origin: MatchOrigin::Matchmade {
                tickets: group.clone(),
            },
        };
        match self.supervisor.create_match(request).await {
            Ok(match_id) => {
                info!(%match_id, ?mode, seats = players.len(), "match paired");
                let event = ServerEvent::MatchFound {
                    match_id,
                    mode,
                    players: players.clone(),
                };
                for player in &players {
                    self.hub.send_to_player(player.player_id, event.clone());
                    let _ = self
                        .state
                        .publish(
                            &keys::player_topic(player.player_id),
                            serde_json::json!({
                                "event": "match_found",
                                "match_id": match_id.to_string(),
                            }),
                        )
                        .await;
                }
                true
            }
            Err(reject) => {
                warn!(?mode, "match creation rejected: {reject}; requeueing group");
                let key = keys::queue(mode);
                for ticket in group {
                    let member = ticket.profile.player_id.to_string();
                    let _ = self.state.zadd(&key, ticket.enqueued_at, &member).await;
                    self.tickets.insert(ticket.profile.player_id, ticket);
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_progression_matches_the_pairing_timeline() {
        // Defaults: initial 50, step 100 per 5s, cap 500.
        let params = Parameters::default();
        let mm = width_fixture(params);
        assert_eq!(mm.width_at(Duration::from_secs(0)), 50);
        assert_eq!(mm.width_at(Duration::from_secs(4)), 50);
        assert_eq!(mm.width_at(Duration::from_secs(5)), 100);
        assert_eq!(mm.width_at(Duration::from_secs(20)), 400);
        assert_eq!(mm.width_at(Duration::from_secs(25)), 500);
        // At the cap the width never widens further.
        assert_eq!(mm.width_at(Duration::from_secs(3600)), 500);
    }

    fn width_fixture(params: Parameters) -> Matchmaker {
        let clock = Arc::new(Clock::new());
        let params = Arc::new(params);
        let state: Arc<dyn StateStore> = Arc::new(store::MemoryStateStore::new());
        let hub = Arc::new(SessionHub::new(clock.clone(), params.clone(), state.clone()));
        let (_tx, rx) = mpsc::channel(1);
        Matchmaker {
            clock,
            params,
            state,
            hub,
            supervisor: SupervisorHandle::disconnected(),
            tickets: HashMap::new(),
            rx,
            shutdown: CancellationToken::new(),
        }
    }
}
