// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-match runtime: a single-writer actor driving one match from
//! `waiting` to a terminal state.
//!
//! One task owns the [`MatchState`] aggregate and selects over its
//! mailbox, the earliest pending deadline and grading completions. Every
//! mutation is persisted as a versioned snapshot before the matching
//! event is broadcast; losing the snapshot compare-and-set means another
//! instance owns the match, and this runtime self-cancels instead of
//! fighting for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use grader::{fallback_report, GradeRequest, GraderClient, GraderError, SandboxClient};
use store::{keys, StateStore};
use store::{MatchRecord, RecordStore};
use types::base::{MatchId, PlayerId, RoundIndex, SubmissionId};
use types::config::Parameters;
use types::error::{ErrorCode, Reject};
use types::event::{LeaveReason, PlayerRoundResult, ServerEvent};
use types::grade::{GradeReport, GradeVerdict};
use types::match_state::{CancelReason, EndReason, MatchConfig, MatchSnapshot, MatchState, MatchStatus};
use types::player::{PlayerProfile, PlayerView};
use types::problem::{Difficulty, Problem};
use types::round::RoundStatus;
use types::submission::{validate_code, Submission, TestOutcome};

use crate::clock::Clock;
use crate::hub::SessionHub;
use crate::matchmaker::{MatchmakerHandle, QueuedTicket};
use crate::supervisor::MatchOrigin;

pub type CommandReply<T> = oneshot::Sender<Result<T, Reject>>;

/// Mailbox commands of one match runtime, already authorized by the hub.
pub enum MatchCommand {
    Join {
        profile: PlayerProfile,
        reply: CommandReply<()>,
    },
    Leave {
        player_id: PlayerId,
        reply: CommandReply<()>,
    },
    Ready {
        player_id: PlayerId,
        reply: CommandReply<()>,
    },
    ForceStart {
        player_id: PlayerId,
        reply: CommandReply<()>,
    },
    Submit {
        player_id: PlayerId,
        round_index: RoundIndex,
        code: String,
        language: String,
        reply: CommandReply<SubmissionId>,
    },
    Spectate {
        profile: PlayerProfile,
        reply: CommandReply<()>,
    },
    StopSpectating {
        player_id: PlayerId,
        reply: CommandReply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<MatchSnapshot>,
    },
    Disconnected {
        player_id: PlayerId,
    },
    Reconnected {
        player_id: PlayerId,
    },
}

/// Shared dependencies handed to every runtime.
#[derive(Clone)]
pub(crate) struct RuntimeDeps {
    pub clock: Arc<Clock>,
    pub params: Arc<Parameters>,
    pub state_store: Arc<dyn StateStore>,
    pub records: Arc<dyn RecordStore>,
    pub grader: Arc<dyn GraderClient>,
    pub sandbox: Arc<dyn SandboxClient>,
    pub hub: Arc<SessionHub>,
    pub matchmaker: MatchmakerHandle,
}

enum Fatal {
    OwnershipLost,
    StoreUnavailable,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TimerKind {
    AutoStart,
    Confirm,
    WaitingTimeout,
    Countdown,
    RoundDeadline,
    GradingDeadline,
    Grace(PlayerId),
    Retention,
}

#[derive(Default)]
struct Timers {
    auto_start: Option<Instant>,
    confirm: Option<Instant>,
    waiting_timeout: Option<Instant>,
    countdown: Option<Instant>,
    round_deadline: Option<Instant>,
    grading_deadline: Option<Instant>,
    retention: Option<Instant>,
    graces: HashMap<PlayerId, Instant>,
}

impl Timers {
    fn next(&self) -> Option<(Instant, TimerKind)> {
        let mut next: Option<(Instant, TimerKind)> = None;
        let mut consider = |at: Option<Instant>, kind: TimerKind| {
            if let Some(at) = at {
                if next.map_or(true, |(best, _)| at < best) {
                    next = Some((at, kind));
                }
            }
        };
        consider(self.auto_start, TimerKind::AutoStart);
        consider(self.confirm, TimerKind::Confirm);
        consider(self.waiting_timeout, TimerKind::WaitingTimeout);
        consider(self.countdown, TimerKind::Countdown);
        consider(self.round_deadline, TimerKind::RoundDeadline);
        consider(self.grading_deadline, TimerKind::GradingDeadline);
        consider(self.retention, TimerKind::Retention);
        for (player, at) in &self.graces {
            consider(Some(*at), TimerKind::Grace(*player));
        }
        next
    }

    fn clear(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::AutoStart => self.auto_start = None,
            TimerKind::Confirm => self.confirm = None,
            TimerKind::WaitingTimeout => self.waiting_timeout = None,
            TimerKind::Countdown => self.countdown = None,
            TimerKind::RoundDeadline => self.round_deadline = None,
            TimerKind::GradingDeadline => self.grading_deadline = None,
            TimerKind::Retention => self.retention = None,
            TimerKind::Grace(player) => {
                self.graces.remove(&player);
            }
        }
    }

    fn clear_prestart(&mut self) {
        self.auto_start = None;
        self.confirm = None;
        self.waiting_timeout = None;
    }

    fn clear_all_but_retention(&mut self) {
        let retention = self.retention;
        *self = Timers::default();
        self.retention = retention;
    }
}

struct GradeDone {
    player_id: PlayerId,
    submission_id: SubmissionId,
    test_outcome: Option<TestOutcome>,
    outcome: Result<GradeReport, (GradeVerdict, String)>,
}

pub(crate) struct MatchRuntime {
    deps: RuntimeDeps,
    state: MatchState,
    origin: MatchOrigin,
    difficulty_pref: Option<Difficulty>,
    rx: mpsc::Receiver<MatchCommand>,
    shutdown: CancellationToken,
    timers: Timers,
    grading: JoinSet<GradeDone>,
    prefetched: Option<Problem>,
    /// Version of the last snapshot accepted by the state store.
    stored_version: Option<types::Version>,
    /// Set once the runtime should exit its loop.
    done: bool,
    /// Whether store keys should be removed on the way out; not when
    /// another instance took the match over.
    owns_store_keys: bool,
}

impl MatchRuntime {
    pub(crate) fn spawn(
        deps: RuntimeDeps,
        match_id: MatchId,
        config: MatchConfig,
        owner: Option<PlayerId>,
        origin: MatchOrigin,
        shutdown: CancellationToken,
    ) -> (mpsc::Sender<MatchCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(deps.params.mailbox_capacity);
        let now = deps.clock.timestamp_ms();
        let state = MatchState::new(match_id, config, owner, now);
        let difficulty_pref = match &origin {
            MatchOrigin::Matchmade { tickets } => {
                tickets.first().and_then(|t| t.preferences.difficulty)
            }
            MatchOrigin::Custom => None,
        };
        let runtime = MatchRuntime {
            deps,
            state,
            origin,
            difficulty_pref,
            rx,
            shutdown,
            timers: Timers::default(),
            grading: JoinSet::new(),
            prefetched: None,
            stored_version: None,
            done: false,
            owns_store_keys: true,
        };
        let join = tokio::spawn(runtime.run());
        (tx, join)
    }

    async fn run(mut self) {
        let match_id = self.state.match_id;
        debug!(%match_id, "match runtime started");
        if let Err(fatal) = self.init().await {
            self.on_fatal(fatal).await;
        }

        while !self.done {
            let next_timer = self.timers.next();
            let timer_at = next_timer
                .map(|(at, _)| at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(24 * 3600));
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let result = self.cancel_match(CancelReason::Shutdown).await;
                    self.done = true;
                    result
                }
                command = self.rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.done = true;
                        Ok(())
                    }
                },
                Some(joined) = self.grading.join_next(), if !self.grading.is_empty() => {
                    match joined {
                        Ok(done) => self.on_grade_done(done).await,
                        Err(err) => {
                            // The grading deadline backstop will fill the gap.
                            warn!(%match_id, "grading task failed: {err}");
                            Ok(())
                        }
                    }
                }
                _ = sleep_until(timer_at), if next_timer.is_some() => {
                    let kind = next_timer.expect("guarded by next_timer").1;
                    self.timers.clear(kind);
                    self.on_timer(kind).await
                }
            };
            if let Err(fatal) = result {
                self.on_fatal(fatal).await;
            }
        }

        self.cleanup().await;
        debug!(%match_id, "match runtime stopped");
    }

    /// Seed the roster, persist the first snapshot and arm the pre-start
    /// timers.
    async fn init(&mut self) -> Result<(), Fatal> {
        let now = self.deps.clock.now();
        let now_ms = self.deps.clock.timestamp_ms();
        let seeds: Vec<PlayerProfile> = match &self.origin {
            MatchOrigin::Matchmade { tickets } => {
                tickets.iter().map(|t| t.profile.clone()).collect()
            }
            MatchOrigin::Custom => Vec::new(),
        };
        for profile in seeds {
            let player_id = profile.player_id;
            if let Err(err) = self.state.add_player(profile, now_ms) {
                warn!(match_id = %self.state.match_id, "seeding failed: {err}");
                continue;
            }
            self.deps.hub.bind_match(player_id, self.state.match_id);
            self.deps.hub.join_room(self.state.match_id, player_id);
        }

        match &self.origin {
            MatchOrigin::Matchmade { .. } => {
                self.timers.confirm = Some(now + self.deps.params.confirmation_window);
            }
            MatchOrigin::Custom => {}
        }
        self.timers.waiting_timeout = Some(now + self.deps.params.waiting_timeout);
        self.persist().await
    }

    // ---- command handling ----------------------------------------------

    async fn handle_command(&mut self, command: MatchCommand) -> Result<(), Fatal> {
        match command {
            MatchCommand::Join { profile, reply } => self.on_join(profile, reply).await,
            MatchCommand::Leave { player_id, reply } => self.on_leave(player_id, reply).await,
            MatchCommand::Ready { player_id, reply } => self.on_ready(player_id, reply).await,
            MatchCommand::ForceStart { player_id, reply } => {
                self.on_force_start(player_id, reply).await
            }
            MatchCommand::Submit {
                player_id,
                round_index,
                code,
                language,
                reply,
            } => self.on_submit(player_id, round_index, code, language, reply).await,
            MatchCommand::Spectate { profile, reply } => self.on_spectate(profile, reply).await,
            MatchCommand::StopSpectating { player_id, reply } => {
                self.on_stop_spectating(player_id, reply).await
            }
            MatchCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
                Ok(())
            }
            MatchCommand::Disconnected { player_id } => self.on_disconnected(player_id).await,
            MatchCommand::Reconnected { player_id } => self.on_reconnected(player_id).await,
        }
    }

    async fn on_join(
        &mut self,
        profile: PlayerProfile,
        reply: CommandReply<()>,
    ) -> Result<(), Fatal> {
        let player_id = profile.player_id;
        if let Err(reject) = self.check_join(&profile) {
            let _ = reply.send(Err(reject));
            return Ok(());
        }
        let now_ms = self.deps.clock.timestamp_ms();
        if let Err(err) = self.state.add_player(profile, now_ms) {
            let _ = reply.send(Err(Reject::new(ErrorCode::Internal, err.to_string())));
            return Ok(());
        }
        self.persist().await?;

        let match_id = self.state.match_id;
        self.deps.hub.bind_match(player_id, match_id);
        self.deps.hub.join_room(match_id, player_id);
        self.deps.hub.replay_chat(match_id, player_id);
        let view = self.state.slot(player_id).map(PlayerView::from);
        let _ = reply.send(Ok(()));
        if let Some(player) = view {
            self.deps.hub.broadcast(match_id, ServerEvent::PlayerJoined {
                match_id,
                version: self.state.version,
                player,
            });
        }

        // Reaching the minimum seat count arms the lobby auto-start.
        if self.state.players.len() >= self.state.config.min_players
            && self.timers.auto_start.is_none()
            && matches!(self.origin, MatchOrigin::Custom)
        {
            self.timers.auto_start =
                Some(self.deps.clock.now() + self.deps.params.auto_start_after);
        }
        self.maybe_start().await
    }

    fn check_join(&self, profile: &PlayerProfile) -> Result<(), Reject> {
        if self.state.is_player(profile.player_id) {
            return Err(Reject::new(ErrorCode::AlreadyInMatch, "already joined"));
        }
        if self.state.status != MatchStatus::Waiting {
            return Err(Reject::wrong_state("match already started"));
        }
        if self.state.config.is_private
            && self.state.owner != Some(profile.player_id)
            && !self.state.config.invited.contains(&profile.player_id)
        {
            return Err(Reject::new(ErrorCode::PrivateDenied, "private lobby"));
        }
        if self.state.players.len() >= self.state.config.max_players {
            return Err(Reject::new(ErrorCode::MatchFull, "match is full"));
        }
        Ok(())
    }

    async fn on_leave(
        &mut self,
        player_id: PlayerId,
        reply: CommandReply<()>,
    ) -> Result<(), Fatal> {
        if !self.state.is_player(player_id) {
            let _ = reply.send(Err(Reject::not_in_match()));
            return Ok(());
        }
        let match_id = self.state.match_id;
        match self.state.status {
            MatchStatus::Waiting => {
                let _ = self.state.remove_player(player_id);
                self.persist().await?;
                self.deps.hub.leave_room(match_id, player_id);
                self.deps.hub.unbind_match(player_id, match_id);
                let _ = reply.send(Ok(()));
                self.deps.hub.broadcast(match_id, ServerEvent::PlayerLeft {
                    match_id,
                    version: self.state.version,
                    player_id,
                    reason: LeaveReason::Left,
                });
                if self.state.owner == Some(player_id) {
                    return self.cancel_match(CancelReason::OwnerCancelled).await;
                }
                if self.state.players.is_empty() {
                    return self.cancel_match(CancelReason::AllDisconnected).await;
                }
                self.maybe_start().await
            }
            MatchStatus::Starting | MatchStatus::InProgress => {
                let _ = reply.send(Ok(()));
                self.forfeit(player_id, LeaveReason::Left).await
            }
            MatchStatus::Completed | MatchStatus::Cancelled => {
                let _ = reply.send(Err(Reject::wrong_state("match is over")));
                Ok(())
            }
        }
    }

    async fn on_ready(
        &mut self,
        player_id: PlayerId,
        reply: CommandReply<()>,
    ) -> Result<(), Fatal> {
        if !self.state.is_player(player_id) {
            let _ = reply.send(Err(Reject::not_in_match()));
            return Ok(());
        }
        if self.state.status != MatchStatus::Waiting {
            let _ = reply.send(Err(Reject::wrong_state("match already started")));
            return Ok(());
        }
        if let Err(err) = self.state.mark_ready(player_id) {
            let _ = reply.send(Err(Reject::new(ErrorCode::Internal, err.to_string())));
            return Ok(());
        }
        self.persist().await?;
        let _ = reply.send(Ok(()));
        self.maybe_start().await
    }

    async fn on_force_start(
        &mut self,
        player_id: PlayerId,
        reply: CommandReply<()>,
    ) -> Result<(), Fatal> {
        if self.state.owner != Some(player_id) {
            let _ = reply.send(Err(Reject::new(
                ErrorCode::NotOwner,
                "only the lobby owner can start the match",
            )));
            return Ok(());
        }
        if self.state.status != MatchStatus::Waiting {
            let _ = reply.send(Err(Reject::wrong_state("match already started")));
            return Ok(());
        }
        if self.state.players.len() < self.state.config.min_players {
            let _ = reply.send(Err(Reject::wrong_state("not enough players")));
            return Ok(());
        }
        let _ = reply.send(Ok(()));
        self.start_countdown().await
    }

    async fn on_submit(
        &mut self,
        player_id: PlayerId,
        round_index: RoundIndex,
        code: String,
        language: String,
        reply: CommandReply<SubmissionId>,
    ) -> Result<(), Fatal> {
        if let Err(reject) = self.check_submit(player_id, round_index, &code, &language) {
            let _ = reply.send(Err(reject));
            return Ok(());
        }
        let now_ms = self.deps.clock.timestamp_ms();
        let submission = Submission {
            submission_id: SubmissionId::generate(),
            match_id: self.state.match_id,
            round_index,
            player_id,
            code,
            language: language.to_lowercase(),
            submitted_at: now_ms,
        };
        let submission_id = match self.state.accept_submission(submission) {
            Ok(id) => id,
            Err(err) => {
                let _ = reply.send(Err(Reject::new(ErrorCode::Internal, err.to_string())));
                return Ok(());
            }
        };
        self.persist().await?;

        let match_id = self.state.match_id;
        let version = self.state.version;
        let _ = reply.send(Ok(submission_id));
        self.deps.hub.send_to_player(player_id, ServerEvent::SubmissionAck {
            match_id,
            version,
            round_index,
            submission_id,
        });
        self.deps.hub.broadcast_except_player(
            match_id,
            player_id,
            ServerEvent::PlayerSubmitted {
                match_id,
                version,
                round_index,
                player_id,
            },
        );

        if self.state.all_submitted() {
            // No need to wait out the clock.
            self.enter_grading().await?;
        }
        Ok(())
    }

    fn check_submit(
        &self,
        player_id: PlayerId,
        round_index: RoundIndex,
        code: &str,
        language: &str,
    ) -> Result<(), Reject> {
        if self.state.status != MatchStatus::InProgress {
            return Err(Reject::wrong_state("match is not in progress"));
        }
        let round = self
            .state
            .current_round()
            .map_err(|_| Reject::wrong_state("no active round"))?;
        if round.status != RoundStatus::Open {
            return Err(Reject::wrong_state("round is not open"));
        }
        if round_index != self.state.cursor {
            return Err(Reject::new(
                ErrorCode::InvalidSubmission,
                "submission targets a stale round",
            ));
        }
        if !self.state.slot(player_id).is_some_and(|s| s.is_active()) {
            return Err(Reject::not_in_match());
        }
        let language = language.to_lowercase();
        if !self.state.config.language_whitelist.contains(&language) {
            return Err(Reject::new(
                ErrorCode::InvalidLanguage,
                format!("language {language} is not allowed in this match"),
            ));
        }
        validate_code(code, self.deps.params.max_code_len)
            .map_err(|err| Reject::new(ErrorCode::InvalidSubmission, err.to_string()))
    }

    async fn on_spectate(
        &mut self,
        profile: PlayerProfile,
        reply: CommandReply<()>,
    ) -> Result<(), Fatal> {
        let player_id = profile.player_id;
        if self.state.status.is_terminal() {
            let _ = reply.send(Err(Reject::wrong_state("match is over")));
            return Ok(());
        }
        if self.state.is_player(player_id) {
            let _ = reply.send(Err(Reject::new(
                ErrorCode::InvalidCommand,
                "players cannot spectate their own match",
            )));
            return Ok(());
        }
        if !self.state.config.allow_spectators {
            let _ = reply.send(Err(Reject::new(
                ErrorCode::PrivateDenied,
                "spectating is disabled for this match",
            )));
            return Ok(());
        }
        if self.state.config.is_private && !self.state.config.invited.contains(&player_id) {
            let _ = reply.send(Err(Reject::new(
                ErrorCode::PrivateDenied,
                "spectators must be invited to a private match",
            )));
            return Ok(());
        }
        self.state.add_spectator(player_id);
        self.persist().await?;
        let match_id = self.state.match_id;
        self.deps.hub.join_room(match_id, player_id);
        self.deps.hub.bind_spectator(player_id, match_id);
        let _ = reply.send(Ok(()));
        self.deps.hub.broadcast(match_id, ServerEvent::SpectatorUpdate {
            match_id,
            spectator_count: self.state.spectators.len(),
        });
        self.deps.hub.replay_chat(match_id, player_id);
        Ok(())
    }

    async fn on_stop_spectating(
        &mut self,
        player_id: PlayerId,
        reply: CommandReply<()>,
    ) -> Result<(), Fatal> {
        if !self.state.remove_spectator(player_id) {
            let _ = reply.send(Err(Reject::new(
                ErrorCode::NotSpectating,
                "not spectating this match",
            )));
            return Ok(());
        }
        self.persist().await?;
        let match_id = self.state.match_id;
        self.deps.hub.leave_room(match_id, player_id);
        self.deps.hub.unbind_spectator(player_id, match_id);
        let _ = reply.send(Ok(()));
        self.deps.hub.broadcast(match_id, ServerEvent::SpectatorUpdate {
            match_id,
            spectator_count: self.state.spectators.len(),
        });
        Ok(())
    }

    async fn on_disconnected(&mut self, player_id: PlayerId) -> Result<(), Fatal> {
        let match_id = self.state.match_id;
        if self.state.is_spectator(player_id) {
            self.state.remove_spectator(player_id);
            self.persist().await?;
            self.deps.hub.unbind_spectator(player_id, match_id);
            self.deps.hub.broadcast(match_id, ServerEvent::SpectatorUpdate {
                match_id,
                spectator_count: self.state.spectators.len(),
            });
            return Ok(());
        }
        if !self.state.is_player(player_id) {
            return Ok(());
        }
        match self.state.status {
            MatchStatus::Waiting => {
                let _ = self.state.remove_player(player_id);
                self.persist().await?;
                self.deps.hub.unbind_match(player_id, match_id);
                self.deps.hub.broadcast(match_id, ServerEvent::PlayerLeft {
                    match_id,
                    version: self.state.version,
                    player_id,
                    reason: LeaveReason::Disconnected,
                });
                if self.state.owner == Some(player_id) {
                    return self.cancel_match(CancelReason::OwnerCancelled).await;
                }
                if self.state.players.is_empty() {
                    return self.cancel_match(CancelReason::AllDisconnected).await;
                }
                if matches!(self.origin, MatchOrigin::Matchmade { .. }) {
                    // A paired player bailed before confirmation; put the
                    // rest back at the head of the queue.
                    self.requeue_tickets(false).await;
                    return self.cancel_match(CancelReason::ConfirmTimeout).await;
                }
                Ok(())
            }
            MatchStatus::Starting | MatchStatus::InProgress => {
                let now_ms = self.deps.clock.timestamp_ms();
                let _ = self.state.set_connected(player_id, false, now_ms);
                self.persist().await?;
                self.deps.hub.broadcast(match_id, ServerEvent::PlayerLeft {
                    match_id,
                    version: self.state.version,
                    player_id,
                    reason: LeaveReason::Disconnected,
                });
                // The seat survives for the grace window.
                self.timers.graces.insert(
                    player_id,
                    self.deps.clock.now() + self.deps.params.grace_disconnect,
                );
                Ok(())
            }
            MatchStatus::Completed | MatchStatus::Cancelled => Ok(()),
        }
    }

    async fn on_reconnected(&mut self, player_id: PlayerId) -> Result<(), Fatal> {
        if !self.state.is_player(player_id) {
            return Ok(());
        }
        let now_ms = self.deps.clock.timestamp_ms();
        let _ = self.state.set_connected(player_id, true, now_ms);
        self.timers.graces.remove(&player_id);
        self.persist().await?;
        self.deps.hub.send_to_player(player_id, ServerEvent::Resync {
            snapshot: self.state.snapshot(),
        });
        Ok(())
    }

    // ---- timers ---------------------------------------------------------

    async fn on_timer(&mut self, kind: TimerKind) -> Result<(), Fatal> {
        match kind {
            TimerKind::AutoStart => {
                if self.state.status == MatchStatus::Waiting
                    && self.state.players.len() >= self.state.config.min_players
                {
                    self.start_countdown().await
                } else {
                    Ok(())
                }
            }
            TimerKind::Confirm => {
                if self.state.status != MatchStatus::Waiting {
                    return Ok(());
                }
                if self.state.all_ready() {
                    return self.start_countdown().await;
                }
                self.requeue_tickets(true).await;
                self.cancel_match(CancelReason::ConfirmTimeout).await
            }
            TimerKind::WaitingTimeout => {
                if self.state.status == MatchStatus::Waiting {
                    self.cancel_match(CancelReason::WaitTimeout).await
                } else {
                    Ok(())
                }
            }
            TimerKind::Countdown => self.start_match().await,
            TimerKind::RoundDeadline => {
                // An expected transition, not an error.
                if self.state.status == MatchStatus::InProgress
                    && self
                        .state
                        .current_round()
                        .map(|r| r.status == RoundStatus::Open)
                        .unwrap_or(false)
                {
                    self.enter_grading().await
                } else {
                    Ok(())
                }
            }
            TimerKind::GradingDeadline => self.finish_grading_by_deadline().await,
            TimerKind::Grace(player_id) => {
                let disconnected = self
                    .state
                    .slot(player_id)
                    .is_some_and(|s| !s.connected && !s.forfeited);
                if disconnected {
                    self.forfeit(player_id, LeaveReason::Forfeited).await
                } else {
                    Ok(())
                }
            }
            TimerKind::Retention => {
                self.done = true;
                Ok(())
            }
        }
    }

    // ---- lifecycle driving ----------------------------------------------

    async fn maybe_start(&mut self) -> Result<(), Fatal> {
        if self.state.status == MatchStatus::Waiting && self.state.all_ready() {
            self.start_countdown().await
        } else {
            Ok(())
        }
    }

    async fn start_countdown(&mut self) -> Result<(), Fatal> {
        if self.state.begin_starting().is_err() {
            return Ok(());
        }
        self.timers.clear_prestart();
        self.persist().await?;
        let match_id = self.state.match_id;
        let countdown = self.deps.params.starting_countdown;
        self.deps.hub.broadcast(match_id, ServerEvent::MatchStarting {
            match_id,
            version: self.state.version,
            countdown_ms: countdown.as_millis() as u64,
        });
        self.timers.countdown = Some(self.deps.clock.now() + countdown);
        // Warm the first problem while the countdown runs.
        self.prefetched = self.fetch_problem().await;
        Ok(())
    }

    async fn fetch_problem(&self) -> Option<Problem> {
        match self
            .deps
            .records
            .fetch_problem(self.state.config.mode, self.difficulty_pref)
            .await
        {
            Ok(problem) => Some(problem),
            Err(err) => {
                warn!(match_id = %self.state.match_id, "problem fetch failed: {err}");
                None
            }
        }
    }

    async fn start_match(&mut self) -> Result<(), Fatal> {
        let now_ms = self.deps.clock.timestamp_ms();
        if self.state.begin(now_ms).is_err() {
            return Ok(());
        }
        self.open_next_round().await
    }

    async fn open_next_round(&mut self) -> Result<(), Fatal> {
        let problem = match self.prefetched.take() {
            Some(problem) => problem,
            None => match self.fetch_problem().await {
                Some(problem) => problem,
                None => {
                    warn!(match_id = %self.state.match_id, "no problem available; cancelling");
                    return self.cancel_match(CancelReason::Internal).await;
                }
            },
        };
        let view = problem.public_view();
        if let Err(err) = self.state.push_round(problem) {
            warn!(match_id = %self.state.match_id, "round setup failed: {err}");
            return self.cancel_match(CancelReason::Internal).await;
        }
        let deadline = self.deps.clock.now() + self.state.config.round_time_limit;
        let deadline_ms = self.deps.clock.timestamp_at(deadline);
        let now_ms = self.deps.clock.timestamp_ms();
        if let Err(err) = self.state.open_round(now_ms, deadline_ms) {
            warn!(match_id = %self.state.match_id, "round open failed: {err}");
            return self.cancel_match(CancelReason::Internal).await;
        }
        self.persist().await?;
        let match_id = self.state.match_id;
        info!(%match_id, round = self.state.cursor, "round open");
        self.deps.hub.broadcast(match_id, ServerEvent::RoundStart {
            match_id,
            version: self.state.version,
            round_index: self.state.cursor,
            problem: view,
            deadline_at: deadline_ms,
        });
        self.timers.round_deadline = Some(deadline);
        Ok(())
    }

    async fn enter_grading(&mut self) -> Result<(), Fatal> {
        self.timers.round_deadline = None;
        if self.state.begin_grading().is_err() {
            return Ok(());
        }
        self.persist().await?;

        let deadline = self.deps.clock.now() + self.deps.params.grading_time_budget;
        self.timers.grading_deadline = Some(deadline);

        let round = match self.state.current_round() {
            Ok(round) => round,
            Err(_) => return Ok(()),
        };
        if round.submissions.is_empty() {
            return self.close_current_round().await;
        }
        let problem = round.problem.clone();
        let pending: Vec<Submission> = round
            .submissions
            .values()
            .filter(|s| !round.grades.contains_key(&s.submission_id))
            .cloned()
            .collect();
        for submission in pending {
            let grader = self.deps.grader.clone();
            let sandbox = self.deps.sandbox.clone();
            let problem = problem.clone();
            self.grading.spawn(async move {
                grade_one(grader, sandbox, problem, submission, deadline).await
            });
        }
        Ok(())
    }

    async fn on_grade_done(&mut self, done: GradeDone) -> Result<(), Fatal> {
        let accepting = self.state.status == MatchStatus::InProgress
            && self.state.current_round().is_ok_and(|round| {
                round.status == RoundStatus::Grading
                    && round
                        .submissions
                        .values()
                        .any(|s| s.submission_id == done.submission_id)
            });
        if !accepting {
            // A straggler from an earlier round; its round already closed
            // with a fallback verdict.
            return Ok(());
        }
        let report = match done.outcome {
            Ok(report) => report,
            Err((verdict, message)) => {
                debug!(
                    match_id = %self.state.match_id,
                    player = %done.player_id,
                    "grading degraded ({verdict:?}): {message}"
                );
                fallback_report(done.submission_id, done.test_outcome, verdict)
            }
        };
        if self.state.record_grade(report).is_err() {
            return Ok(());
        }
        self.persist().await?;

        let round = match self.state.current_round() {
            Ok(round) => round,
            Err(_) => return Ok(()),
        };
        if round.graded_count() >= round.submissions.len() {
            self.timers.grading_deadline = None;
            self.close_current_round().await?;
        }
        Ok(())
    }

    /// The grading deadline elapsed with reports still missing: assign the
    /// fallback verdict to the stragglers and move on.
    async fn finish_grading_by_deadline(&mut self) -> Result<(), Fatal> {
        let in_grading = self.state.status == MatchStatus::InProgress
            && self
                .state
                .current_round()
                .map(|r| r.status == RoundStatus::Grading)
                .unwrap_or(false);
        if !in_grading {
            return Ok(());
        }
        self.grading.abort_all();
        let missing: Vec<SubmissionId> = {
            let round = self.state.current_round().expect("checked above");
            round
                .submissions
                .values()
                .filter(|s| !round.grades.contains_key(&s.submission_id))
                .map(|s| s.submission_id)
                .collect()
        };
        for submission_id in missing {
            let report = fallback_report(submission_id, None, GradeVerdict::Timeout);
            let _ = self.state.record_grade(report);
        }
        self.persist().await?;
        self.close_current_round().await
    }

    async fn close_current_round(&mut self) -> Result<(), Fatal> {
        self.timers.grading_deadline = None;
        let round_index = self.state.cursor;
        let degraded = self
            .state
            .current_round()
            .map(|r| r.grading_degraded)
            .unwrap_or(false);
        let now_ms = self.deps.clock.timestamp_ms();
        let outcomes = match self.state.close_round(now_ms) {
            Ok(outcomes) => outcomes,
            Err(err) => {
                warn!(match_id = %self.state.match_id, "round close failed: {err}");
                return self.cancel_match(CancelReason::Internal).await;
            }
        };
        self.persist().await?;

        let match_id = self.state.match_id;
        let per_player = outcomes
            .into_iter()
            .map(|outcome| PlayerRoundResult {
                display_name: self
                    .state
                    .slot(outcome.player_id)
                    .map(|s| s.profile.display_name.clone())
                    .unwrap_or_default(),
                player_id: outcome.player_id,
                score: outcome.score,
                total: outcome.total,
                grade: outcome.grade,
            })
            .collect();
        self.deps.hub.broadcast(match_id, ServerEvent::RoundResult {
            match_id,
            version: self.state.version,
            round_index,
            per_player,
            grading_degraded: degraded,
        });

        if self.state.status == MatchStatus::Completed {
            self.announce_end().await;
            self.finish_terminal().await;
            Ok(())
        } else {
            self.open_next_round().await
        }
    }

    async fn forfeit(&mut self, player_id: PlayerId, reason: LeaveReason) -> Result<(), Fatal> {
        if self.state.mark_forfeited(player_id).is_err() {
            return Ok(());
        }
        self.timers.graces.remove(&player_id);
        self.persist().await?;
        let match_id = self.state.match_id;
        self.deps.hub.broadcast(match_id, ServerEvent::PlayerLeft {
            match_id,
            version: self.state.version,
            player_id,
            reason,
        });
        self.deps.hub.unbind_match(player_id, match_id);
        self.check_forfeit_outcome().await
    }

    async fn check_forfeit_outcome(&mut self) -> Result<(), Fatal> {
        let active: Vec<PlayerId> = self
            .state
            .active_players()
            .map(|s| s.player_id())
            .collect();
        match self.state.status {
            MatchStatus::Starting => {
                if active.len() < self.state.config.min_players {
                    self.cancel_match(CancelReason::PlayerDropped).await
                } else {
                    Ok(())
                }
            }
            MatchStatus::InProgress => {
                if active.is_empty() {
                    return self.cancel_match(CancelReason::AllDisconnected).await;
                }
                // Only a head-to-head match ends by forfeit; in larger
                // lobbies the absent players score zero and play goes on,
                // even down to a single survivor.
                if active.len() == 1 && self.state.config.max_players == 2 {
                    return self.forfeit_win(active[0]).await;
                }
                // The absent player scores zero from here on. The round
                // may now be fully submitted.
                if self
                    .state
                    .current_round()
                    .map(|r| r.status == RoundStatus::Open)
                    .unwrap_or(false)
                    && self.state.all_submitted()
                {
                    self.enter_grading().await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    async fn forfeit_win(&mut self, winner: PlayerId) -> Result<(), Fatal> {
        let now_ms = self.deps.clock.timestamp_ms();
        if self.state.complete_by_forfeit(winner, now_ms).is_err() {
            return Ok(());
        }
        self.grading.abort_all();
        self.persist().await?;
        self.announce_end().await;
        self.finish_terminal().await;
        Ok(())
    }

    async fn cancel_match(&mut self, reason: CancelReason) -> Result<(), Fatal> {
        if self.state.status.is_terminal() {
            return Ok(());
        }
        let now_ms = self.deps.clock.timestamp_ms();
        if self.state.cancel(reason, now_ms).is_err() {
            return Ok(());
        }
        self.grading.abort_all();
        // Best effort: a cancellation triggered by store loss cannot
        // insist on the store accepting the terminal snapshot.
        if let Err(fatal) = self.persist().await {
            if matches!(fatal, Fatal::OwnershipLost) {
                self.owns_store_keys = false;
            }
            self.done = true;
        }
        self.announce_end().await;
        self.finish_terminal().await;
        if reason == CancelReason::Shutdown {
            self.done = true;
        }
        Ok(())
    }

    /// Put the remaining paired players back at the head of the queue;
    /// their original enqueue times keep their position. When the pairing
    /// died on the confirmation deadline, only players who did confirm go
    /// back; when the opponent vanished, everyone still connected does.
    async fn requeue_tickets(&mut self, require_ready: bool) {
        let MatchOrigin::Matchmade { tickets } = &self.origin else {
            return;
        };
        let remaining: Vec<QueuedTicket> = tickets
            .iter()
            .filter(|t| {
                self.state
                    .slot(t.profile.player_id)
                    .map(|s| s.connected && (!require_ready || s.ready))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if !remaining.is_empty() {
            info!(
                match_id = %self.state.match_id,
                count = remaining.len(),
                "requeueing paired players"
            );
            self.deps.matchmaker.requeue_front(remaining).await;
        }
    }

    async fn announce_end(&mut self) {
        let match_id = self.state.match_id;
        let reason = self
            .state
            .end_reason
            .clone()
            .unwrap_or(EndReason::Completed);
        self.deps.hub.broadcast(match_id, ServerEvent::MatchEnd {
            match_id,
            version: self.state.version,
            standings: self.state.standings(),
            reason,
        });
    }

    /// Persist the durable record and start the retention window during
    /// which late clients can still fetch the final snapshot.
    async fn finish_terminal(&mut self) {
        let record = MatchRecord {
            match_id: self.state.match_id,
            mode: self.state.config.mode,
            ranked: self.state.config.is_ranked,
            standings: self.state.standings(),
            round_scores: self
                .state
                .rounds
                .iter()
                .filter(|r| r.status == RoundStatus::Closed)
                .map(|r| r.scores.clone())
                .collect(),
            end_reason: self.state.end_reason.clone().unwrap_or(EndReason::Completed),
            started_at: self.state.started_at,
            ended_at: self.state.ended_at.unwrap_or_else(|| self.deps.clock.timestamp_ms()),
        };
        if let Err(err) = self.deps.records.save_match_record(record).await {
            warn!(match_id = %self.state.match_id, "saving match record failed: {err}");
        }
        // Players are free again immediately; the room itself lives on
        // through the retention window for late resyncs.
        let match_id = self.state.match_id;
        for player in &self.state.players {
            self.deps.hub.unbind_match(player.player_id(), match_id);
        }
        self.timers.clear_all_but_retention();
        if self.timers.retention.is_none() {
            self.timers.retention =
                Some(self.deps.clock.now() + self.deps.params.retention_window);
        }
    }

    // ---- persistence ----------------------------------------------------

    /// CAS-write the current snapshot, retrying transient failures with
    /// capped backoff. A conflict is never retried: it means this runtime
    /// lost ownership.
    async fn persist(&mut self) -> Result<(), Fatal> {
        let snapshot = self.state.snapshot();
        let value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(err) => {
                warn!(match_id = %self.state.match_id, "snapshot serialization failed: {err}");
                return Ok(());
            }
        };
        let key = keys::match_snapshot(self.state.match_id);
        let mut delay = self.deps.params.store_retry_initial;
        for attempt in 0..self.deps.params.store_retry_attempts {
            match self
                .deps
                .state_store
                .cas_set(&key, self.stored_version, value.clone())
                .await
            {
                Ok(version) => {
                    self.stored_version = Some(version);
                    let _ = self
                        .deps
                        .state_store
                        .publish(
                            &keys::match_topic(self.state.match_id),
                            serde_json::json!({
                                "version": snapshot.version,
                                "status": self.state.status,
                            }),
                        )
                        .await;
                    return Ok(());
                }
                Err(err) if err.is_conflict() => {
                    warn!(
                        match_id = %self.state.match_id,
                        version = snapshot.version,
                        "snapshot CAS conflict; assuming another instance owns the match"
                    );
                    return Err(Fatal::OwnershipLost);
                }
                Err(err) => {
                    debug!(
                        match_id = %self.state.match_id,
                        attempt,
                        "snapshot write failed: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.deps.params.store_retry_max);
                }
            }
        }
        Err(Fatal::StoreUnavailable)
    }

    async fn on_fatal(&mut self, fatal: Fatal) {
        let match_id = self.state.match_id;
        match fatal {
            Fatal::OwnershipLost => {
                warn!(%match_id, "self-cancelling after ownership loss");
                self.owns_store_keys = false;
                let now_ms = self.deps.clock.timestamp_ms();
                let _ = self.state.cancel(CancelReason::Internal, now_ms);
                self.announce_end().await;
                self.done = true;
            }
            Fatal::StoreUnavailable => {
                warn!(%match_id, "state store unavailable; cancelling match");
                let now_ms = self.deps.clock.timestamp_ms();
                let _ = self.state.cancel(CancelReason::StoreUnavailable, now_ms);
                self.announce_end().await;
                self.finish_terminal().await;
                self.done = true;
            }
        }
    }

    async fn cleanup(&mut self) {
        self.grading.abort_all();
        let match_id = self.state.match_id;
        for player in &self.state.players {
            self.deps.hub.unbind_match(player.player_id(), match_id);
        }
        self.deps.hub.close_room(match_id);
        if self.owns_store_keys {
            let _ = self.deps.state_store.remove(&keys::match_snapshot(match_id)).await;
            let _ = self.deps.state_store.remove(&keys::match_owner(match_id)).await;
            let _ = self
                .deps
                .state_store
                .remove(&keys::custom_lobby(match_id))
                .await;
        }
    }
}

/// Run one submission through the sandbox and the grader, both bounded by
/// the same absolute deadline.
async fn grade_one(
    grader: Arc<dyn GraderClient>,
    sandbox: Arc<dyn SandboxClient>,
    problem: Problem,
    submission: Submission,
    deadline: Instant,
) -> GradeDone {
    let player_id = submission.player_id;
    let submission_id = submission.submission_id;

    let test_outcome = match timeout_at(
        deadline,
        sandbox.run_tests(&submission.code, &submission.language, &problem),
    )
    .await
    {
        Ok(Ok(outcome)) => Some(outcome),
        Ok(Err(_)) | Err(_) => None,
    };

    let request = GradeRequest {
        submission_id,
        match_id: submission.match_id,
        round_index: submission.round_index,
        problem,
        code: submission.code,
        language: submission.language,
        test_outcome,
    };
    let outcome = match timeout_at(deadline, grader.grade(request)).await {
        Ok(Ok(report)) => Ok(report),
        Ok(Err(GraderError::Invalid(message))) => Err((GradeVerdict::Invalid, message)),
        Ok(Err(err)) => Err((GradeVerdict::GraderError, err.to_string())),
        Err(_) => Err((
            GradeVerdict::Timeout,
            "grading deadline elapsed".to_string(),
        )),
    };
    GradeDone {
        player_id,
        submission_id,
        test_outcome,
        outcome,
    }
}
