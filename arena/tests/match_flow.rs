// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end match lifecycle scenarios, driven through the session hub
//! under paused virtual time.

mod common;

use std::time::Duration;

use common::{advance_and_settle, settle, TestArena};
use grader::GradeScript;
use types::command::{ClientCommand, CustomGameOptions};
use types::config::Parameters;
use types::error::ErrorCode;
use types::event::{LeaveReason, ServerEvent};
use types::grade::CriteriaScores;
use types::match_state::{CancelReason, EndReason, MatchStatus};
use types::mode::MatchMode;
use types::submission::TestOutcome;

fn full_marks() -> GradeScript {
    GradeScript::Score(CriteriaScores::new(40.0, 25.0, 20.0, 10.0, 5.0))
}

fn eighty_marks() -> GradeScript {
    GradeScript::Score(CriteriaScores::new(32.0, 20.0, 16.0, 8.0, 4.0))
}

#[tokio::test(start_paused = true)]
async fn casual_1v1_runs_three_rounds_to_completion() {
    let arena = TestArena::start(Parameters::default()).await;
    arena.grader.script_code("solution-a", full_marks());
    arena.grader.script_code("solution-b", eighty_marks());

    let mut alice = arena.connect("alice", 1000).await;
    let mut bob = arena.connect("bob", 1020).await;

    alice
        .send(ClientCommand::FindMatch {
            mode: MatchMode::Casual,
            preferences: Default::default(),
        })
        .await;
    bob.send(ClientCommand::FindMatch {
        mode: MatchMode::Casual,
        preferences: Default::default(),
    })
    .await;

    let match_id = alice
        .expect("match found", |e| match e {
            ServerEvent::MatchFound { match_id, mode, players } => {
                assert_eq!(mode, MatchMode::Casual);
                assert_eq!(players.len(), 2);
                Some(match_id)
            }
            _ => None,
        })
        .await;
    bob.expect("match found", |e| matches!(e, ServerEvent::MatchFound { .. }).then_some(()))
        .await;

    alice.send(ClientCommand::Ready { match_id }).await;
    bob.send(ClientCommand::Ready { match_id }).await;

    let countdown_ms = alice
        .expect("match starting", |e| match e {
            ServerEvent::MatchStarting { countdown_ms, .. } => Some(countdown_ms),
            _ => None,
        })
        .await;
    assert_eq!(countdown_ms, 3_000);
    advance_and_settle(Duration::from_millis(countdown_ms)).await;

    for round in 0u32..3 {
        let round_index = alice
            .expect("round start", |e| match e {
                ServerEvent::RoundStart { round_index, problem, .. } => {
                    assert!(!problem.statement.is_empty());
                    Some(round_index)
                }
                _ => None,
            })
            .await;
        assert_eq!(round_index, round);
        bob.drain().await;

        advance_and_settle(Duration::from_secs(30)).await;
        alice
            .send(ClientCommand::SubmitSolution {
                match_id,
                round_index: round,
                code: "solution-a".to_string(),
                language: "python".to_string(),
            })
            .await;
        alice
            .expect("submission ack", |e| {
                matches!(e, ServerEvent::SubmissionAck { .. }).then_some(())
            })
            .await;
        bob.expect("opponent submitted", |e| match e {
            ServerEvent::PlayerSubmitted { player_id, .. } => {
                assert_eq!(player_id, alice.profile.player_id);
                Some(())
            }
            _ => None,
        })
        .await;

        advance_and_settle(Duration::from_secs(15)).await;
        bob.send(ClientCommand::SubmitSolution {
            match_id,
            round_index: round,
            code: "solution-b".to_string(),
            language: "python".to_string(),
        })
        .await;

        // All seats submitted: the round grades and closes without
        // waiting out the clock.
        let (scores, degraded) = alice
            .expect("round result", |e| match e {
                ServerEvent::RoundResult { per_player, grading_degraded, .. } => {
                    Some((per_player, grading_degraded))
                }
                _ => None,
            })
            .await;
        assert!(!degraded);
        let score_of = |id| {
            scores
                .iter()
                .find(|p| p.player_id == id)
                .map(|p| (p.score, p.total))
                .unwrap()
        };
        assert_eq!(score_of(alice.profile.player_id), (100, 100 * (round + 1)));
        assert_eq!(score_of(bob.profile.player_id), (80, 80 * (round + 1)));
        bob.drain().await;
    }

    let standings = alice
        .expect("match end", |e| match e {
            ServerEvent::MatchEnd { standings, reason, .. } => {
                assert_eq!(reason, EndReason::Completed);
                Some(standings)
            }
            _ => None,
        })
        .await;
    assert_eq!(standings.len(), 2);
    assert_eq!(standings[0].player_id, alice.profile.player_id);
    assert_eq!(standings[0].total, 300);
    assert_eq!(standings[1].player_id, bob.profile.player_id);
    assert_eq!(standings[1].total, 240);

    alice.assert_versions_strictly_increasing(match_id);

    let records = arena.records.saved_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].match_id, match_id);
    assert_eq!(records[0].standings[0].total, 300);
    assert_eq!(records[0].round_scores.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn grader_outage_degrades_to_heuristic_scores() {
    let arena = TestArena::start(Parameters::default()).await;
    arena.grader.set_default(GradeScript::Fail("model offline".to_string()));
    arena
        .sandbox
        .script_code("three-of-four", TestOutcome { passed: 3, total: 4 });
    arena
        .sandbox
        .script_code("all-pass", TestOutcome { passed: 4, total: 4 });

    let mut owner = arena.connect("ada", 1200).await;
    let mut guest = arena.connect("grace", 1180).await;

    owner
        .send(ClientCommand::CreateCustom {
            config: CustomGameOptions {
                max_players: Some(2),
                round_count: Some(1),
                ..Default::default()
            },
        })
        .await;
    let match_id = owner
        .expect("custom created", |e| match e {
            ServerEvent::CustomCreated { match_id } => Some(match_id),
            _ => None,
        })
        .await;

    owner.send(ClientCommand::JoinGame { match_id }).await;
    guest.send(ClientCommand::JoinGame { match_id }).await;
    owner.send(ClientCommand::Ready { match_id }).await;
    guest.send(ClientCommand::Ready { match_id }).await;
    advance_and_settle(Duration::from_secs(3)).await;

    owner
        .expect("round start", |e| matches!(e, ServerEvent::RoundStart { .. }).then_some(()))
        .await;
    owner
        .send(ClientCommand::SubmitSolution {
            match_id,
            round_index: 0,
            code: "three-of-four".to_string(),
            language: "python".to_string(),
        })
        .await;
    guest
        .send(ClientCommand::SubmitSolution {
            match_id,
            round_index: 0,
            code: "all-pass".to_string(),
            language: "python".to_string(),
        })
        .await;

    let (scores, degraded) = owner
        .expect("round result", |e| match e {
            ServerEvent::RoundResult { per_player, grading_degraded, .. } => {
                Some((per_player, grading_degraded))
            }
            _ => None,
        })
        .await;
    assert!(degraded, "fallback verdicts must flag the round as degraded");

    // 3/4 tests: 30 + 12.5 + 10 + 5 + 0 = 57.5 -> 58.
    // 4/4 tests: 40 + 12.5 + 10 + 5 + 0 = 67.5 -> 68.
    let score_of = |id| scores.iter().find(|p| p.player_id == id).unwrap();
    assert_eq!(score_of(owner.profile.player_id).score, 58);
    assert_eq!(score_of(guest.profile.player_id).score, 68);
    assert!(score_of(owner.profile.player_id)
        .grade
        .as_ref()
        .is_some_and(|g| g.is_degraded()));

    let standings = owner
        .expect("match end", |e| match e {
            ServerEvent::MatchEnd { standings, .. } => Some(standings),
            _ => None,
        })
        .await;
    assert_eq!(standings[0].player_id, guest.profile.player_id);
}

#[tokio::test(start_paused = true)]
async fn disconnect_and_reconnect_within_grace_keeps_the_seat() {
    let arena = TestArena::start(Parameters::default()).await;

    let mut alice = arena.connect("alice", 1000).await;
    let mut bob = arena.connect("bob", 1010).await;
    let match_id = start_casual(&mut alice, &mut bob).await;

    alice
        .expect("round start", |e| matches!(e, ServerEvent::RoundStart { .. }).then_some(()))
        .await;
    bob.drain().await;

    // Bob drops mid-round.
    advance_and_settle(Duration::from_secs(20)).await;
    bob.disconnect().await;
    alice
        .expect("bob marked disconnected", |e| match e {
            ServerEvent::PlayerLeft { player_id, reason, .. } => {
                assert_eq!(player_id, bob.profile.player_id);
                assert_eq!(reason, LeaveReason::Disconnected);
                Some(())
            }
            _ => None,
        })
        .await;

    // Back before the grace window ends: the seat is intact and the
    // snapshot is replayed.
    advance_and_settle(Duration::from_secs(30)).await;
    let mut bob = arena.connect_as(bob.profile.clone()).await;
    let snapshot = bob
        .expect("resync after reconnect", |e| match e {
            ServerEvent::Resync { snapshot } => Some(snapshot),
            _ => None,
        })
        .await;
    assert_eq!(snapshot.match_id, match_id);
    assert_eq!(snapshot.status, MatchStatus::InProgress);
    assert!(snapshot.current_round.is_some());

    advance_and_settle(Duration::from_secs(8)).await;
    bob.send(ClientCommand::SubmitSolution {
        match_id,
        round_index: 0,
        code: "late but present".to_string(),
        language: "python".to_string(),
    })
    .await;
    bob.expect("submission accepted", |e| {
        matches!(e, ServerEvent::SubmissionAck { .. }).then_some(())
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn grace_expiry_forfeits_the_match_to_the_survivor() {
    let arena = TestArena::start(Parameters::default()).await;

    let mut alice = arena.connect("alice", 1000).await;
    let mut bob = arena.connect("bob", 1010).await;
    let _match_id = start_casual(&mut alice, &mut bob).await;

    alice
        .expect("round start", |e| matches!(e, ServerEvent::RoundStart { .. }).then_some(()))
        .await;

    advance_and_settle(Duration::from_secs(20)).await;
    bob.disconnect().await;
    alice
        .expect("bob disconnected", |e| {
            matches!(e, ServerEvent::PlayerLeft { .. }).then_some(())
        })
        .await;

    // Just before the grace deadline nothing happens.
    advance_and_settle(Duration::from_secs(59)).await;
    assert!(alice
        .drain()
        .await
        .iter()
        .all(|e| !matches!(e, ServerEvent::MatchEnd { .. })));

    // At expiry the survivor wins by forfeit.
    advance_and_settle(Duration::from_secs(2)).await;
    let (standings, reason) = alice
        .expect("forfeit match end", |e| match e {
            ServerEvent::MatchEnd { standings, reason, .. } => Some((standings, reason)),
            _ => None,
        })
        .await;
    assert_eq!(
        reason,
        EndReason::Forfeit {
            winner: alice.profile.player_id
        }
    );
    assert_eq!(standings[0].player_id, alice.profile.player_id);
    assert!(standings.iter().any(|s| s.forfeited));

    let records = arena.records.saved_records();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].end_reason, EndReason::Forfeit { .. }));
}

#[tokio::test(start_paused = true)]
async fn practice_mode_is_a_single_player_single_round_match() {
    let arena = TestArena::start(Parameters::default()).await;

    let mut solo = arena.connect("hermit", 900).await;
    solo.send(ClientCommand::FindMatch {
        mode: MatchMode::Practice,
        preferences: Default::default(),
    })
    .await;
    let match_id = solo
        .expect("practice match found", |e| match e {
            ServerEvent::MatchFound { match_id, players, .. } => {
                assert_eq!(players.len(), 1);
                Some(match_id)
            }
            _ => None,
        })
        .await;
    solo.send(ClientCommand::Ready { match_id }).await;
    advance_and_settle(Duration::from_secs(3)).await;

    solo.expect("round start", |e| matches!(e, ServerEvent::RoundStart { .. }).then_some(()))
        .await;
    solo.send(ClientCommand::SubmitSolution {
        match_id,
        round_index: 0,
        code: "print(42)".to_string(),
        language: "python".to_string(),
    })
    .await;

    solo.expect("round result", |e| matches!(e, ServerEvent::RoundResult { .. }).then_some(()))
        .await;
    let standings = solo
        .expect("match end", |e| match e {
            ServerEvent::MatchEnd { standings, reason, .. } => {
                assert_eq!(reason, EndReason::Completed);
                Some(standings)
            }
            _ => None,
        })
        .await;
    assert_eq!(standings.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn submissions_validate_language_round_and_deadline() {
    let arena = TestArena::start(Parameters::default()).await;

    let mut alice = arena.connect("alice", 1000).await;
    let mut bob = arena.connect("bob", 1010).await;
    let match_id = start_casual(&mut alice, &mut bob).await;
    alice
        .expect("round start", |e| matches!(e, ServerEvent::RoundStart { .. }).then_some(()))
        .await;

    // Unlisted language.
    alice
        .send(ClientCommand::SubmitSolution {
            match_id,
            round_index: 0,
            code: "BEGIN".to_string(),
            language: "cobol".to_string(),
        })
        .await;
    alice
        .expect("language rejected", |e| match e {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::InvalidLanguage);
                Some(())
            }
            _ => None,
        })
        .await;

    // Stale round index.
    alice
        .send(ClientCommand::SubmitSolution {
            match_id,
            round_index: 2,
            code: "print(1)".to_string(),
            language: "python".to_string(),
        })
        .await;
    alice
        .expect("stale round rejected", |e| match e {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::InvalidSubmission);
                Some(())
            }
            _ => None,
        })
        .await;

    // Over the deadline the round closes on its own and the next one
    // opens, so a round-0 submission is now stale.
    advance_and_settle(Duration::from_secs(301)).await;
    alice
        .send(ClientCommand::SubmitSolution {
            match_id,
            round_index: 0,
            code: "print(1)".to_string(),
            language: "python".to_string(),
        })
        .await;
    alice
        .expect("late submission rejected", |e| match e {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::InvalidSubmission);
                Some(())
            }
            _ => None,
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn losing_the_snapshot_cas_cancels_the_match() {
    let arena = TestArena::start(Parameters::default()).await;

    let mut alice = arena.connect("alice", 1000).await;
    let mut bob = arena.connect("bob", 1010).await;
    let match_id = start_casual(&mut alice, &mut bob).await;
    alice
        .expect("round start", |e| matches!(e, ServerEvent::RoundStart { .. }).then_some(()))
        .await;

    // Another instance takes the snapshot: the next write conflicts and
    // this runtime self-cancels instead of fighting.
    arena.state.conflict_next_cas();
    alice
        .send(ClientCommand::SubmitSolution {
            match_id,
            round_index: 0,
            code: "print(1)".to_string(),
            language: "python".to_string(),
        })
        .await;

    let reason = alice
        .expect("cancelled on ownership loss", |e| match e {
            ServerEvent::MatchEnd { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
    assert_eq!(
        reason,
        EndReason::Cancelled {
            reason: CancelReason::Internal
        }
    );
}

#[tokio::test(start_paused = true)]
async fn node_shutdown_cancels_live_matches() {
    let arena = TestArena::start(Parameters::default()).await;

    let mut alice = arena.connect("alice", 1000).await;
    let mut bob = arena.connect("bob", 1010).await;
    let _match_id = start_casual(&mut alice, &mut bob).await;
    alice
        .expect("round start", |e| matches!(e, ServerEvent::RoundStart { .. }).then_some(()))
        .await;

    let records = arena.records.clone();
    arena.node.shutdown().await;
    settle().await;

    let reason = alice
        .expect("shutdown cancellation", |e| match e {
            ServerEvent::MatchEnd { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
    assert_eq!(
        reason,
        EndReason::Cancelled {
            reason: CancelReason::Shutdown
        }
    );
    // A minimal terminal record still lands.
    assert_eq!(records.saved_records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn multiplayer_match_continues_past_disconnected_players() {
    let arena = TestArena::start(Parameters::default()).await;
    let (match_id, mut owner, mut guests) = start_custom_four(&arena).await;

    owner
        .expect("round start", |e| matches!(e, ServerEvent::RoundStart { .. }).then_some(()))
        .await;
    for guest in &mut guests {
        guest.drain().await;
    }

    // Two of the four seats drop and stay away past the grace window.
    advance_and_settle(Duration::from_secs(5)).await;
    guests[1].disconnect().await;
    guests[2].disconnect().await;
    advance_and_settle(Duration::from_secs(61)).await;

    let events = owner.drain().await;
    let forfeits = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                ServerEvent::PlayerLeft {
                    reason: LeaveReason::Forfeited,
                    ..
                }
            )
        })
        .count();
    assert_eq!(forfeits, 2);
    assert!(
        events.iter().all(|e| !matches!(e, ServerEvent::MatchEnd { .. })),
        "a lobby with more than two seats keeps playing; absent players just score zero"
    );

    // The remaining two submit and the round closes normally.
    owner
        .send(ClientCommand::SubmitSolution {
            match_id,
            round_index: 0,
            code: "print(42)".to_string(),
            language: "python".to_string(),
        })
        .await;
    guests[0]
        .send(ClientCommand::SubmitSolution {
            match_id,
            round_index: 0,
            code: "print(42)".to_string(),
            language: "python".to_string(),
        })
        .await;

    let (scores, _) = owner
        .expect("round result", |e| match e {
            ServerEvent::RoundResult { per_player, grading_degraded, .. } => {
                Some((per_player, grading_degraded))
            }
            _ => None,
        })
        .await;
    assert_eq!(scores.len(), 4);
    let score_of = |id| scores.iter().find(|p| p.player_id == id).map(|p| p.score).unwrap();
    assert_eq!(score_of(owner.profile.player_id), 80);
    assert_eq!(score_of(guests[0].profile.player_id), 80);
    assert_eq!(score_of(guests[1].profile.player_id), 0);
    assert_eq!(score_of(guests[2].profile.player_id), 0);

    let (standings, reason) = owner
        .expect("match end", |e| match e {
            ServerEvent::MatchEnd { standings, reason, .. } => Some((standings, reason)),
            _ => None,
        })
        .await;
    assert_eq!(reason, EndReason::Completed);
    assert_eq!(standings.len(), 4);
    assert_eq!(standings.iter().filter(|s| s.forfeited).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn multiplayer_match_does_not_forfeit_to_the_last_survivor() {
    let arena = TestArena::start(Parameters::default()).await;
    let (match_id, mut owner, mut guests) = start_custom_four(&arena).await;

    owner
        .expect("round start", |e| matches!(e, ServerEvent::RoundStart { .. }).then_some(()))
        .await;

    // Everyone but the owner vanishes past the grace window. Only a
    // two-seat match ends by forfeit; here the survivor plays on alone.
    for guest in &mut guests {
        guest.disconnect().await;
    }
    advance_and_settle(Duration::from_secs(61)).await;
    assert!(
        owner
            .drain()
            .await
            .iter()
            .all(|e| !matches!(e, ServerEvent::MatchEnd { .. })),
        "no early forfeit win in a four-seat lobby"
    );

    owner
        .send(ClientCommand::SubmitSolution {
            match_id,
            round_index: 0,
            code: "print(42)".to_string(),
            language: "python".to_string(),
        })
        .await;

    let (standings, reason) = owner
        .expect("match end", |e| match e {
            ServerEvent::MatchEnd { standings, reason, .. } => Some((standings, reason)),
            _ => None,
        })
        .await;
    assert_eq!(reason, EndReason::Completed);
    assert_eq!(standings[0].player_id, owner.profile.player_id);
    assert_eq!(standings[0].total, 80);
    assert!(standings.iter().skip(1).all(|s| s.forfeited && s.total == 0));
}

/// Create a four-seat single-round custom lobby, join everyone, ready
/// everyone and run the countdown down.
async fn start_custom_four(
    arena: &TestArena,
) -> (types::MatchId, common::Client, Vec<common::Client>) {
    let mut owner = arena.connect("owner", 1000).await;
    let mut guests = Vec::new();
    for i in 0..3 {
        guests.push(arena.connect(&format!("guest-{i}"), 1000).await);
    }

    owner
        .send(ClientCommand::CreateCustom {
            config: CustomGameOptions {
                max_players: Some(4),
                round_count: Some(1),
                ..Default::default()
            },
        })
        .await;
    let match_id = owner
        .expect("lobby created", |e| match e {
            ServerEvent::CustomCreated { match_id } => Some(match_id),
            _ => None,
        })
        .await;

    owner.send(ClientCommand::JoinGame { match_id }).await;
    for guest in &guests {
        guest.send(ClientCommand::JoinGame { match_id }).await;
    }
    owner.send(ClientCommand::Ready { match_id }).await;
    for guest in &guests {
        guest.send(ClientCommand::Ready { match_id }).await;
    }
    advance_and_settle(Duration::from_secs(3)).await;
    (match_id, owner, guests)
}

/// Queue two compatible players into a casual match, ready them up and
/// run the countdown down. Returns the match id with the first round
/// open.
async fn start_casual(alice: &mut common::Client, bob: &mut common::Client) -> types::MatchId {
    alice
        .send(ClientCommand::FindMatch {
            mode: MatchMode::Casual,
            preferences: Default::default(),
        })
        .await;
    bob.send(ClientCommand::FindMatch {
        mode: MatchMode::Casual,
        preferences: Default::default(),
    })
    .await;
    let match_id = alice
        .expect("match found", |e| match e {
            ServerEvent::MatchFound { match_id, .. } => Some(match_id),
            _ => None,
        })
        .await;
    bob.drain().await;
    alice.send(ClientCommand::Ready { match_id }).await;
    bob.send(ClientCommand::Ready { match_id }).await;
    advance_and_settle(Duration::from_secs(3)).await;
    match_id
}
