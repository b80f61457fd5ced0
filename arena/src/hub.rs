// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! The session hub: the duplex boundary between connections and the core.
//!
//! The hub owns the `connection <-> player <-> match` mapping, fans
//! events out to rooms, applies per-connection chat limits and survives
//! brief disconnects. It validates and routes inbound commands into the
//! owning runtime's mailbox but never mutates match state itself: the
//! runtime is the single writer, the hub only holds routing references.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use store::{keys, StateStore};
use types::base::{ConnectionId, MatchId, PlayerId};
use types::command::ClientCommand;
use types::config::Parameters;
use types::error::{ErrorCode, Reject};
use types::event::ServerEvent;
use types::player::PlayerProfile;

use crate::clock::Clock;
use crate::matchmaker::MatchmakerHandle;
use crate::runtime::MatchCommand;
use crate::supervisor::Routes;
use crate::throttle::TokenBucket;

/// Outbound frames are dropped rather than awaited when a client cannot
/// keep up; the version gap tells the client to resync. Must exceed the
/// chat history bound so a full replay fits.
const OUTBOUND_CAPACITY: usize = 512;

pub fn outbound_channel() -> (mpsc::Sender<ServerEvent>, mpsc::Receiver<ServerEvent>) {
    mpsc::channel(OUTBOUND_CAPACITY)
}

pub struct SessionHub {
    clock: Arc<Clock>,
    params: Arc<Parameters>,
    state: Arc<dyn StateStore>,
    inner: RwLock<HubInner>,
    wiring: OnceLock<HubWiring>,
}

struct HubWiring {
    matchmaker: MatchmakerHandle,
    routes: Routes,
}

#[derive(Default)]
struct HubInner {
    conns: HashMap<ConnectionId, ConnEntry>,
    players: HashMap<PlayerId, PlayerEntry>,
    rooms: HashMap<MatchId, Room>,
    /// Weak routing only: which live match a player belongs to.
    player_match: HashMap<PlayerId, MatchId>,
    /// Matches a player is currently spectating.
    spectating: HashMap<PlayerId, HashSet<MatchId>>,
}

struct ConnEntry {
    player_id: PlayerId,
    sender: mpsc::Sender<ServerEvent>,
    chat_bucket: TokenBucket,
}

struct PlayerEntry {
    profile: PlayerProfile,
    conns: HashSet<ConnectionId>,
}

#[derive(Default)]
struct Room {
    members: HashSet<ConnectionId>,
    chat: VecDeque<ServerEvent>,
}

impl SessionHub {
    pub fn new(clock: Arc<Clock>, params: Arc<Parameters>, state: Arc<dyn StateStore>) -> Self {
        Self {
            clock,
            params,
            state,
            inner: RwLock::new(HubInner::default()),
            wiring: OnceLock::new(),
        }
    }

    /// Late binding for the command routing targets; called once during
    /// node wiring, before any connection registers.
    pub fn wire(&self, matchmaker: MatchmakerHandle, routes: Routes) {
        if self.wiring.set(HubWiring { matchmaker, routes }).is_err() {
            warn!("session hub wired twice; keeping the first wiring");
        }
    }

    fn wiring(&self) -> &HubWiring {
        self.wiring.get().expect("session hub used before wiring")
    }

    // ---- connection lifecycle -------------------------------------------

    /// Register an authenticated connection. Re-attaches a returning
    /// player to their live match room and asks the runtime for a resync.
    pub async fn register(
        &self,
        profile: PlayerProfile,
        sender: mpsc::Sender<ServerEvent>,
    ) -> ConnectionId {
        let conn_id = ConnectionId::generate();
        let player_id = profile.player_id;
        let active_match = {
            let mut inner = self.inner.write();
            let chat_bucket = TokenBucket::per_window(
                self.params.chat_rate_per_10s,
                10,
                self.clock.now(),
            );
            inner.conns.insert(
                conn_id,
                ConnEntry {
                    player_id,
                    sender,
                    chat_bucket,
                },
            );
            inner
                .players
                .entry(player_id)
                .or_insert_with(|| PlayerEntry {
                    profile,
                    conns: HashSet::new(),
                })
                .conns
                .insert(conn_id);
            let active_match = inner.player_match.get(&player_id).copied();
            if let Some(match_id) = active_match {
                inner.rooms.entry(match_id).or_default().members.insert(conn_id);
            }
            active_match
        };

        if let Err(err) = self.state.sadd(keys::ONLINE, &player_id.to_string()).await {
            debug!(%player_id, "presence update failed: {err}");
        }
        self.write_presence(player_id, active_match).await;

        self.send_to_conn(conn_id, self.server_stats().await);

        if let Some(match_id) = active_match {
            if let Some(mailbox) = self.wiring().routes.get(match_id) {
                let _ = mailbox.send(MatchCommand::Reconnected { player_id }).await;
            }
        }
        conn_id
    }

    /// Drop a connection. When it was the player's last one, presence is
    /// cleared, a queued ticket is cancelled and their live match starts
    /// its disconnect grace window.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        let (player_id, last_conn, active_match, spectated) = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.conns.remove(&conn_id) else {
                return;
            };
            let player_id = entry.player_id;
            for room in inner.rooms.values_mut() {
                room.members.remove(&conn_id);
            }
            let last_conn = match inner.players.get_mut(&player_id) {
                Some(player) => {
                    player.conns.remove(&conn_id);
                    player.conns.is_empty()
                }
                None => true,
            };
            let spectated: Vec<MatchId> = if last_conn {
                inner.players.remove(&player_id);
                inner
                    .spectating
                    .remove(&player_id)
                    .map(|set| set.into_iter().collect())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            (
                player_id,
                last_conn,
                inner.player_match.get(&player_id).copied(),
                spectated,
            )
        };

        if !last_conn {
            return;
        }

        if let Err(err) = self.state.srem(keys::ONLINE, &player_id.to_string()).await {
            debug!(%player_id, "presence update failed: {err}");
        }
        self.write_presence(player_id, None).await;
        self.wiring().matchmaker.player_disconnected(player_id).await;
        for match_id in active_match.into_iter().chain(spectated) {
            if let Some(mailbox) = self.wiring().routes.get(match_id) {
                let _ = mailbox.send(MatchCommand::Disconnected { player_id }).await;
            }
        }
    }

    /// Presence writes are advisory; a concurrent tick losing its CAS is
    /// a no-op conflict and not worth a fight.
    async fn write_presence(&self, player_id: PlayerId, active_match: Option<MatchId>) {
        let key = keys::presence(player_id);
        let value = serde_json::json!({
            "last_seen": self.clock.timestamp_ms(),
            "active_match_id": active_match.map(|id| id.to_string()),
        });
        for _ in 0..2 {
            let expected = match self.state.get(&key).await {
                Ok(found) => found.map(|v| v.version),
                Err(_) => return,
            };
            match self.state.cas_set(&key, expected, value.clone()).await {
                Ok(_) => return,
                Err(err) if err.is_conflict() => continue,
                Err(_) => return,
            }
        }
    }

    // ---- inbound routing ------------------------------------------------

    /// Validate and route one inbound command. Per-connection ordering is
    /// the caller's (transport's) responsibility: commands from one
    /// connection are dispatched sequentially.
    pub async fn handle_command(&self, conn_id: ConnectionId, command: ClientCommand) {
        let Some(profile) = self.profile_of(conn_id) else {
            return;
        };
        match command {
            ClientCommand::FindMatch { mode, preferences } => {
                if self.bound_match(profile.player_id).is_some() {
                    self.reject(conn_id, Reject::new(ErrorCode::AlreadyInMatch, "already in a match"));
                    return;
                }
                match self.wiring().matchmaker.enqueue(profile, mode, preferences).await {
                    Ok(position_in_queue) => self.send_to_conn(
                        conn_id,
                        ServerEvent::MatchmakingStatus {
                            mode,
                            position_in_queue,
                        },
                    ),
                    Err(reject) => self.reject(conn_id, reject),
                }
            }
            ClientCommand::CancelMatchmaking {} => {
                if self.wiring().matchmaker.cancel(profile.player_id).await {
                    self.send_to_conn(conn_id, ServerEvent::MatchmakingCancelled {});
                } else {
                    self.reject(
                        conn_id,
                        Reject::new(ErrorCode::InvalidCommand, "no active matchmaking"),
                    );
                }
            }
            ClientCommand::CreateCustom { config } => {
                match self.wiring().matchmaker.create_custom(profile, config).await {
                    Ok(match_id) => self.send_to_conn(conn_id, ServerEvent::CustomCreated { match_id }),
                    Err(reject) => self.reject(conn_id, reject),
                }
            }
            ClientCommand::JoinGame { match_id } => {
                self.roundtrip(conn_id, match_id, |reply| MatchCommand::Join {
                    profile,
                    reply,
                })
                .await;
            }
            ClientCommand::LeaveGame { match_id } => {
                let player_id = profile.player_id;
                self.roundtrip(conn_id, match_id, |reply| MatchCommand::Leave {
                    player_id,
                    reply,
                })
                .await;
            }
            ClientCommand::Ready { match_id } => {
                let player_id = profile.player_id;
                self.roundtrip(conn_id, match_id, |reply| MatchCommand::Ready {
                    player_id,
                    reply,
                })
                .await;
            }
            ClientCommand::StartGame { match_id } => {
                let player_id = profile.player_id;
                self.roundtrip(conn_id, match_id, |reply| MatchCommand::ForceStart {
                    player_id,
                    reply,
                })
                .await;
            }
            ClientCommand::SubmitSolution {
                match_id,
                round_index,
                code,
                language,
            } => {
                let player_id = profile.player_id;
                self.roundtrip(conn_id, match_id, move |reply| MatchCommand::Submit {
                    player_id,
                    round_index,
                    code,
                    language,
                    reply,
                })
                .await;
            }
            ClientCommand::SpectateGame { match_id } => {
                self.roundtrip(conn_id, match_id, |reply| MatchCommand::Spectate {
                    profile,
                    reply,
                })
                .await;
            }
            ClientCommand::StopSpectating { match_id } => {
                let player_id = profile.player_id;
                self.roundtrip(conn_id, match_id, |reply| MatchCommand::StopSpectating {
                    player_id,
                    reply,
                })
                .await;
            }
            ClientCommand::GetGameState { match_id } => {
                let Some(mailbox) = self.wiring().routes.get(match_id) else {
                    self.reject(conn_id, Reject::match_not_found(match_id));
                    return;
                };
                let (reply, rx) = oneshot::channel();
                if mailbox.send(MatchCommand::Snapshot { reply }).await.is_ok() {
                    if let Ok(snapshot) = rx.await {
                        // Room membership covers live participants; the
                        // roster check lets a player who reconnected after
                        // match end still fetch the final snapshot.
                        let roster_member = snapshot
                            .players
                            .iter()
                            .any(|p| p.player_id == profile.player_id);
                        if self.in_room(match_id, conn_id) || roster_member {
                            self.send_to_conn(conn_id, ServerEvent::Resync { snapshot });
                        } else {
                            self.reject(conn_id, Reject::not_in_match());
                        }
                    }
                }
            }
            ClientCommand::SendChatMessage { match_id, text } => {
                self.handle_chat(conn_id, profile, match_id, text);
            }
            ClientCommand::UserTyping { match_id, is_typing } => {
                self.handle_typing(conn_id, profile, match_id, is_typing);
            }
        }
    }

    /// Send a command whose reply is only interesting on rejection.
    async fn roundtrip<T>(
        &self,
        conn_id: ConnectionId,
        match_id: MatchId,
        build: impl FnOnce(oneshot::Sender<Result<T, Reject>>) -> MatchCommand,
    ) {
        let Some(mailbox) = self.wiring().routes.get(match_id) else {
            self.reject(conn_id, Reject::match_not_found(match_id));
            return;
        };
        let (reply, rx) = oneshot::channel();
        if mailbox.send(build(reply)).await.is_err() {
            self.reject(conn_id, Reject::match_not_found(match_id));
            return;
        }
        match rx.await {
            Ok(Ok(_)) => {}
            Ok(Err(reject)) => self.reject(conn_id, reject),
            Err(_) => self.reject(
                conn_id,
                Reject::new(ErrorCode::Internal, "match runtime went away"),
            ),
        }
    }

    // ---- chat and typing ------------------------------------------------

    fn handle_chat(
        &self,
        conn_id: ConnectionId,
        profile: PlayerProfile,
        match_id: MatchId,
        text: String,
    ) {
        let text = text.trim().to_string();
        if text.is_empty() {
            self.reject(conn_id, Reject::new(ErrorCode::EmptyMessage, "message is empty"));
            return;
        }
        if text.chars().count() > self.params.chat_max_len {
            self.reject(
                conn_id,
                Reject::new(ErrorCode::MessageTooLong, "message too long"),
            );
            return;
        }
        if let Err(reject) = self.check_room_and_bucket(conn_id, match_id) {
            self.reject(conn_id, reject);
            return;
        }

        let event = ServerEvent::ChatMessage {
            match_id,
            from: profile.player_id,
            display_name: profile.display_name,
            text,
            ts: self.clock.timestamp_ms(),
        };
        {
            let mut inner = self.inner.write();
            let history_size = self.params.chat_history_size;
            if let Some(room) = inner.rooms.get_mut(&match_id) {
                room.chat.push_back(event.clone());
                while room.chat.len() > history_size {
                    room.chat.pop_front();
                }
            }
        }
        self.broadcast(match_id, event);
    }

    fn handle_typing(
        &self,
        conn_id: ConnectionId,
        profile: PlayerProfile,
        match_id: MatchId,
        is_typing: bool,
    ) {
        if let Err(reject) = self.check_room_and_bucket(conn_id, match_id) {
            self.reject(conn_id, reject);
            return;
        }
        self.broadcast_except(
            match_id,
            Some(conn_id),
            ServerEvent::UserTyping {
                match_id,
                from: profile.player_id,
                is_typing,
            },
        );
    }

    fn check_room_and_bucket(
        &self,
        conn_id: ConnectionId,
        match_id: MatchId,
    ) -> Result<(), Reject> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let member = inner
            .rooms
            .get(&match_id)
            .is_some_and(|room| room.members.contains(&conn_id));
        if !member {
            return Err(Reject::not_in_match());
        }
        let entry = inner
            .conns
            .get_mut(&conn_id)
            .ok_or_else(Reject::not_in_match)?;
        if !entry.chat_bucket.allow(now) {
            return Err(Reject::new(ErrorCode::RateLimited, "slow down"));
        }
        Ok(())
    }

    // ---- room management (called by runtimes) ---------------------------

    pub fn join_room(&self, match_id: MatchId, player_id: PlayerId) {
        let mut inner = self.inner.write();
        let conns: Vec<ConnectionId> = inner
            .players
            .get(&player_id)
            .map(|p| p.conns.iter().copied().collect())
            .unwrap_or_default();
        let room = inner.rooms.entry(match_id).or_default();
        for conn in conns {
            room.members.insert(conn);
        }
    }

    pub fn leave_room(&self, match_id: MatchId, player_id: PlayerId) {
        let mut inner = self.inner.write();
        let conns: Vec<ConnectionId> = inner
            .players
            .get(&player_id)
            .map(|p| p.conns.iter().copied().collect())
            .unwrap_or_default();
        if let Some(room) = inner.rooms.get_mut(&match_id) {
            for conn in conns {
                room.members.remove(&conn);
            }
        }
    }

    /// Record which live match a player belongs to, for reconnect routing.
    pub fn bind_match(&self, player_id: PlayerId, match_id: MatchId) {
        self.inner.write().player_match.insert(player_id, match_id);
    }

    /// Remove the binding only while it still points at this match; the
    /// player may have moved on to a newer one.
    pub fn unbind_match(&self, player_id: PlayerId, match_id: MatchId) {
        let mut inner = self.inner.write();
        if inner.player_match.get(&player_id) == Some(&match_id) {
            inner.player_match.remove(&player_id);
        }
    }

    pub fn bind_spectator(&self, player_id: PlayerId, match_id: MatchId) {
        self.inner
            .write()
            .spectating
            .entry(player_id)
            .or_default()
            .insert(match_id);
    }

    pub fn unbind_spectator(&self, player_id: PlayerId, match_id: MatchId) {
        let mut inner = self.inner.write();
        if let Some(set) = inner.spectating.get_mut(&player_id) {
            set.remove(&match_id);
            if set.is_empty() {
                inner.spectating.remove(&player_id);
            }
        }
    }

    pub fn close_room(&self, match_id: MatchId) {
        let mut inner = self.inner.write();
        inner.rooms.remove(&match_id);
        inner.player_match.retain(|_, m| *m != match_id);
        inner.spectating.retain(|_, set| {
            set.remove(&match_id);
            !set.is_empty()
        });
    }

    /// Deliver the bounded chat history to a player that joined late.
    pub fn replay_chat(&self, match_id: MatchId, player_id: PlayerId) {
        let events: Vec<ServerEvent> = {
            let inner = self.inner.read();
            inner
                .rooms
                .get(&match_id)
                .map(|room| room.chat.iter().cloned().collect())
                .unwrap_or_default()
        };
        for event in events {
            self.send_to_player(player_id, event);
        }
    }

    // ---- outbound fan-out -----------------------------------------------

    pub fn broadcast(&self, match_id: MatchId, event: ServerEvent) {
        self.broadcast_except(match_id, None, event);
    }

    /// Broadcast to the room minus every connection of one player (used
    /// for notices the acting player gets in a direct form instead).
    pub fn broadcast_except_player(
        &self,
        match_id: MatchId,
        player_id: PlayerId,
        event: ServerEvent,
    ) {
        let senders: Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> = {
            let inner = self.inner.read();
            let Some(room) = inner.rooms.get(&match_id) else {
                return;
            };
            room.members
                .iter()
                .filter_map(|conn| inner.conns.get(conn).map(|entry| (*conn, entry)))
                .filter(|(_, entry)| entry.player_id != player_id)
                .map(|(conn, entry)| (conn, entry.sender.clone()))
                .collect()
        };
        for (conn, sender) in senders {
            if let Err(err) = sender.try_send(event.clone()) {
                warn!(%match_id, %conn, "dropping outbound event: {err}");
            }
        }
    }

    pub fn broadcast_except(
        &self,
        match_id: MatchId,
        except: Option<ConnectionId>,
        event: ServerEvent,
    ) {
        let senders: Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> = {
            let inner = self.inner.read();
            let Some(room) = inner.rooms.get(&match_id) else {
                return;
            };
            room.members
                .iter()
                .filter(|conn| Some(**conn) != except)
                .filter_map(|conn| {
                    inner
                        .conns
                        .get(conn)
                        .map(|entry| (*conn, entry.sender.clone()))
                })
                .collect()
        };
        for (conn, sender) in senders {
            if let Err(err) = sender.try_send(event.clone()) {
                warn!(%match_id, %conn, "dropping outbound event: {err}");
            }
        }
    }

    pub fn send_to_player(&self, player_id: PlayerId, event: ServerEvent) {
        let senders: Vec<mpsc::Sender<ServerEvent>> = {
            let inner = self.inner.read();
            inner
                .players
                .get(&player_id)
                .map(|p| {
                    p.conns
                        .iter()
                        .filter_map(|c| inner.conns.get(c).map(|e| e.sender.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        for sender in senders {
            if let Err(err) = sender.try_send(event.clone()) {
                warn!(%player_id, "dropping outbound event: {err}");
            }
        }
    }

    pub fn send_to_conn(&self, conn_id: ConnectionId, event: ServerEvent) {
        let sender = {
            let inner = self.inner.read();
            inner.conns.get(&conn_id).map(|e| e.sender.clone())
        };
        if let Some(sender) = sender {
            if let Err(err) = sender.try_send(event) {
                warn!(%conn_id, "dropping outbound event: {err}");
            }
        }
    }

    fn reject(&self, conn_id: ConnectionId, reject: Reject) {
        self.send_to_conn(conn_id, ServerEvent::Error {
            code: reject.code,
            message: reject.message,
        });
    }

    // ---- lookups --------------------------------------------------------

    fn profile_of(&self, conn_id: ConnectionId) -> Option<PlayerProfile> {
        let inner = self.inner.read();
        let player_id = inner.conns.get(&conn_id)?.player_id;
        inner.players.get(&player_id).map(|p| p.profile.clone())
    }

    pub fn bound_match(&self, player_id: PlayerId) -> Option<MatchId> {
        self.inner.read().player_match.get(&player_id).copied()
    }

    fn in_room(&self, match_id: MatchId, conn_id: ConnectionId) -> bool {
        self.inner
            .read()
            .rooms
            .get(&match_id)
            .is_some_and(|room| room.members.contains(&conn_id))
    }

    pub fn online_connections(&self) -> usize {
        self.inner.read().conns.len()
    }

    async fn server_stats(&self) -> ServerEvent {
        let wiring = self.wiring();
        ServerEvent::ServerStats {
            online_connections: self.online_connections(),
            active_matches: wiring.routes.len(),
            queued_players: wiring.matchmaker.queue_depth().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryStateStore;
    async fn wired_hub() -> (Arc<SessionHub>, Routes) {
        let clock = Arc::new(Clock::new());
        let params = Arc::new(Parameters::default());
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let hub = Arc::new(SessionHub::new(clock, params, state));
        let routes = Routes::new();
        hub.wire(MatchmakerHandle::disconnected(), routes.clone());
        (hub, routes)
    }

    #[tokio::test(start_paused = true)]
    async fn chat_is_rate_limited_and_history_bounded() {
        let (hub, _routes) = wired_hub().await;
        let alice = PlayerProfile::new("alice", 1000);
        let bob = PlayerProfile::new("bob", 1000);
        let (tx_a, mut rx_a) = outbound_channel();
        let (tx_b, mut rx_b) = outbound_channel();
        let conn_a = hub.register(alice.clone(), tx_a).await;
        let _conn_b = hub.register(bob.clone(), tx_b).await;
        let match_id = MatchId::generate();
        hub.join_room(match_id, alice.player_id);
        hub.join_room(match_id, bob.player_id);
        // Drain the registration stats events.
        let _ = rx_a.try_recv();
        let _ = rx_b.try_recv();

        for i in 0..12 {
            hub.handle_command(
                conn_a,
                ClientCommand::SendChatMessage {
                    match_id,
                    text: format!("hello {i}"),
                },
            )
            .await;
        }

        let mut delivered = 0;
        let mut limited = 0;
        while let Ok(event) = rx_a.try_recv() {
            match event {
                ServerEvent::ChatMessage { .. } => delivered += 1,
                ServerEvent::Error {
                    code: ErrorCode::RateLimited,
                    ..
                } => limited += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(delivered, 10);
        assert_eq!(limited, 2);

        // Bob received only the delivered messages.
        let mut bob_got = 0;
        while let Ok(event) = rx_b.try_recv() {
            if matches!(event, ServerEvent::ChatMessage { .. }) {
                bob_got += 1;
            }
        }
        assert_eq!(bob_got, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_replay_is_bounded_to_history_size() {
        let (hub, _routes) = wired_hub().await;
        let alice = PlayerProfile::new("alice", 1000);
        let (tx_a, _rx_a) = outbound_channel();
        let conn_a = hub.register(alice.clone(), tx_a).await;
        let match_id = MatchId::generate();
        hub.join_room(match_id, alice.player_id);

        for i in 0..250 {
            // Keep the bucket full by refilling between messages.
            tokio::time::advance(std::time::Duration::from_secs(2)).await;
            hub.handle_command(
                conn_a,
                ClientCommand::SendChatMessage {
                    match_id,
                    text: format!("m{i}"),
                },
            )
            .await;
        }

        let late = PlayerProfile::new("late", 900);
        let (tx_l, mut rx_l) = outbound_channel();
        let _conn_l = hub.register(late.clone(), tx_l).await;
        hub.join_room(match_id, late.player_id);
        hub.replay_chat(match_id, late.player_id);

        let mut replayed = Vec::new();
        while let Ok(event) = rx_l.try_recv() {
            if let ServerEvent::ChatMessage { text, .. } = event {
                replayed.push(text);
            }
        }
        // The oldest fifty fell off the ring.
        assert_eq!(replayed.len(), 200);
        assert_eq!(replayed.first().unwrap(), "m50");
        assert_eq!(replayed.last().unwrap(), "m249");
    }

    #[tokio::test]
    async fn chat_outside_a_room_is_rejected() {
        let (hub, _routes) = wired_hub().await;
        let alice = PlayerProfile::new("alice", 1000);
        let (tx, mut rx) = outbound_channel();
        let conn = hub.register(alice, tx).await;
        let _ = rx.try_recv();
        hub.handle_command(
            conn,
            ClientCommand::SendChatMessage {
                match_id: MatchId::generate(),
                text: "anyone there?".to_string(),
            },
        )
        .await;
        match rx.try_recv().unwrap() {
            ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotInMatch),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn commands_to_unknown_matches_are_rejected() {
        let (hub, _routes) = wired_hub().await;
        let alice = PlayerProfile::new("alice", 1000);
        let (tx, mut rx) = outbound_channel();
        let conn = hub.register(alice, tx).await;
        let _ = rx.try_recv();
        hub.handle_command(
            conn,
            ClientCommand::Ready {
                match_id: MatchId::generate(),
            },
        )
        .await;
        match rx.try_recv().unwrap() {
            ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::MatchNotFound),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_follows_registration(){
        let (hub, _routes) = wired_hub().await;
        let state = hub.state.clone();
        let alice = PlayerProfile::new("alice", 1000);
        let (tx, _rx) = outbound_channel();
        let conn = hub.register(alice.clone(), tx).await;
        let online = state.smembers(keys::ONLINE).await.unwrap();
        assert_eq!(online, vec![alice.player_id.to_string()]);

        hub.disconnect(conn).await;
        assert!(state.smembers(keys::ONLINE).await.unwrap().is_empty());
    }
}
