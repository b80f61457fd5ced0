// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! Queueing, pairing and custom lobby scenarios.

mod common;

use std::time::Duration;

use common::{advance_and_settle, TestArena};
use store::keys;
use store::StateStore as _;
use types::command::{ClientCommand, CustomGameOptions};
use types::config::Parameters;
use types::error::ErrorCode;
use types::event::ServerEvent;
use types::match_state::{CancelReason, EndReason};
use types::mode::MatchMode;

#[tokio::test(start_paused = true)]
async fn rating_width_widens_until_distant_players_pair() {
    let arena = TestArena::start(Parameters::default()).await;

    // Gap of 400: initial width 50, +100 per 5 s of waiting, capped at
    // 500. Width 400 at 20 s does not admit the pair (strict), width 500
    // at 25 s does.
    let mut near = arena.connect("near", 1000).await;
    let mut far = arena.connect("far", 1400).await;

    near.send(ClientCommand::FindMatch {
        mode: MatchMode::Ranked,
        preferences: Default::default(),
    })
    .await;
    far.send(ClientCommand::FindMatch {
        mode: MatchMode::Ranked,
        preferences: Default::default(),
    })
    .await;

    let not_paired = |events: Vec<ServerEvent>| {
        assert!(
            events.iter().all(|e| !matches!(e, ServerEvent::MatchFound { .. })),
            "paired too early"
        );
    };

    not_paired(near.drain().await);
    advance_and_settle(Duration::from_secs(5)).await; // width 100
    not_paired(near.drain().await);
    advance_and_settle(Duration::from_secs(15)).await; // t = 20 s, width 400
    not_paired(near.drain().await);
    not_paired(far.drain().await);

    advance_and_settle(Duration::from_secs(5)).await; // t = 25 s, width 500
    near.expect("paired at 25 s", |e| {
        matches!(e, ServerEvent::MatchFound { .. }).then_some(())
    })
    .await;
    far.expect("paired at 25 s", |e| {
        matches!(e, ServerEvent::MatchFound { .. }).then_some(())
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn close_ratings_pair_immediately() {
    let arena = TestArena::start(Parameters::default()).await;
    let mut a = arena.connect("a", 1500).await;
    let mut b = arena.connect("b", 1520).await;

    a.send(ClientCommand::FindMatch {
        mode: MatchMode::Blitz,
        preferences: Default::default(),
    })
    .await;
    b.send(ClientCommand::FindMatch {
        mode: MatchMode::Blitz,
        preferences: Default::default(),
    })
    .await;

    a.expect("instant pair", |e| match e {
        ServerEvent::MatchFound { mode, .. } => {
            assert_eq!(mode, MatchMode::Blitz);
            Some(())
        }
        _ => None,
    })
    .await;
    b.expect("instant pair", |e| {
        matches!(e, ServerEvent::MatchFound { .. }).then_some(())
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_matchmaking_leaves_the_queue_unchanged() {
    let arena = TestArena::start(Parameters::default()).await;
    let mut player = arena.connect("solo", 1000).await;

    player
        .send(ClientCommand::FindMatch {
            mode: MatchMode::Casual,
            preferences: Default::default(),
        })
        .await;
    player
        .expect("queued", |e| match e {
            ServerEvent::MatchmakingStatus { position_in_queue, .. } => {
                assert_eq!(position_in_queue, 1);
                Some(())
            }
            _ => None,
        })
        .await;
    assert_eq!(
        arena
            .state
            .zrange_head(&keys::queue(MatchMode::Casual), 10)
            .await
            .unwrap()
            .len(),
        1
    );

    player.send(ClientCommand::CancelMatchmaking {}).await;
    player
        .expect("cancelled", |e| {
            matches!(e, ServerEvent::MatchmakingCancelled {}).then_some(())
        })
        .await;
    assert!(arena
        .state
        .zrange_head(&keys::queue(MatchMode::Casual), 10)
        .await
        .unwrap()
        .is_empty());

    // A second cancel is a no-op surfaced as a validation error.
    player.send(ClientCommand::CancelMatchmaking {}).await;
    player
        .expect("nothing to cancel", |e| match e {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::InvalidCommand);
                Some(())
            }
            _ => None,
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn disconnecting_while_queued_cancels_the_ticket() {
    let arena = TestArena::start(Parameters::default()).await;
    let player = arena.connect("ghost", 1000).await;

    player
        .send(ClientCommand::FindMatch {
            mode: MatchMode::Casual,
            preferences: Default::default(),
        })
        .await;
    player.disconnect().await;

    assert!(arena
        .state
        .zrange_head(&keys::queue(MatchMode::Casual), 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn custom_lobby_rejects_joins_over_capacity() {
    let arena = TestArena::start(Parameters::default()).await;
    let mut owner = arena.connect("owner", 1000).await;
    let mut second = arena.connect("second", 1000).await;
    let mut third = arena.connect("third", 1000).await;

    owner
        .send(ClientCommand::CreateCustom {
            config: CustomGameOptions {
                max_players: Some(2),
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
    second.send(ClientCommand::JoinGame { match_id }).await;
    let second_player_id = second.profile.player_id;
    second
        .expect("join confirmed", |e| match e {
            ServerEvent::PlayerJoined { player, .. } => {
                (player.player_id == second_player_id).then_some(())
            }
            _ => None,
        })
        .await;

    third.send(ClientCommand::JoinGame { match_id }).await;
    third
        .expect("rejected over capacity", |e| match e {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::MatchFull);
                Some(())
            }
            _ => None,
        })
        .await;

    // The full lobby still starts normally.
    owner.send(ClientCommand::Ready { match_id }).await;
    second.send(ClientCommand::Ready { match_id }).await;
    owner
        .expect("lobby starts", |e| {
            matches!(e, ServerEvent::MatchStarting { .. }).then_some(())
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn private_lobbies_gate_joins_and_spectators_on_the_invite_list() {
    let arena = TestArena::start(Parameters::default()).await;
    let mut owner = arena.connect("owner", 1000).await;
    let mut invitee = arena.connect("invitee", 1000).await;
    let mut stranger = arena.connect("stranger", 1000).await;
    let mut watcher = arena.connect("watcher", 1000).await;

    owner
        .send(ClientCommand::CreateCustom {
            config: CustomGameOptions {
                max_players: Some(4),
                is_private: Some(true),
                invited: vec![invitee.profile.player_id, watcher.profile.player_id],
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

    stranger.send(ClientCommand::JoinGame { match_id }).await;
    stranger
        .expect("join denied", |e| match e {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::PrivateDenied);
                Some(())
            }
            _ => None,
        })
        .await;

    invitee.send(ClientCommand::JoinGame { match_id }).await;
    invitee
        .expect("invited join ok", |e| {
            matches!(e, ServerEvent::PlayerJoined { .. }).then_some(())
        })
        .await;

    stranger.send(ClientCommand::SpectateGame { match_id }).await;
    stranger
        .expect("spectate denied", |e| match e {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::PrivateDenied);
                Some(())
            }
            _ => None,
        })
        .await;

    watcher.send(ClientCommand::SpectateGame { match_id }).await;
    watcher
        .expect("invited spectator ok", |e| match e {
            ServerEvent::SpectatorUpdate { spectator_count, .. } => {
                assert_eq!(spectator_count, 1);
                Some(())
            }
            _ => None,
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn only_the_owner_can_force_start_a_lobby() {
    let arena = TestArena::start(Parameters::default()).await;
    let mut owner = arena.connect("owner", 1000).await;
    let mut guest = arena.connect("guest", 1000).await;

    owner
        .send(ClientCommand::CreateCustom {
            config: CustomGameOptions::default(),
        })
        .await;
    let match_id = owner
        .expect("lobby created", |e| match e {
            ServerEvent::CustomCreated { match_id } => Some(match_id),
            _ => None,
        })
        .await;
    owner.send(ClientCommand::JoinGame { match_id }).await;
    guest.send(ClientCommand::JoinGame { match_id }).await;

    guest.send(ClientCommand::StartGame { match_id }).await;
    guest
        .expect("non-owner rejected", |e| match e {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::NotOwner);
                Some(())
            }
            _ => None,
        })
        .await;

    owner.send(ClientCommand::StartGame { match_id }).await;
    owner
        .expect("owner start accepted", |e| {
            matches!(e, ServerEvent::MatchStarting { .. }).then_some(())
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn the_match_cap_pushes_back_on_lobby_creation() {
    let params = Parameters {
        max_live_matches: 0,
        ..Parameters::default()
    };
    let arena = TestArena::start(params).await;
    let mut owner = arena.connect("owner", 1000).await;

    owner
        .send(ClientCommand::CreateCustom {
            config: CustomGameOptions::default(),
        })
        .await;
    owner
        .expect("capacity exhausted", |e| match e {
            ServerEvent::Error { code, .. } => {
                assert_eq!(code, ErrorCode::CapacityExhausted);
                Some(())
            }
            _ => None,
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn trivia_fill_deadline_starts_with_the_largest_group() {
    let arena = TestArena::start(Parameters::default()).await;
    let mut players = Vec::new();
    for i in 0u32..3 {
        let mut p = arena.connect(&format!("quizzer-{i}"), 1000 + i * 10).await;
        p.send(ClientCommand::FindMatch {
            mode: MatchMode::Trivia,
            preferences: Default::default(),
        })
        .await;
        players.push(p);
    }

    // Three of four seats filled: nothing until the fill deadline.
    advance_and_settle(Duration::from_secs(10)).await;
    for p in &mut players {
        assert!(p
            .drain()
            .await
            .iter()
            .all(|e| !matches!(e, ServerEvent::MatchFound { .. })));
    }

    advance_and_settle(Duration::from_secs(21)).await;
    for p in &mut players {
        p.expect("grouped after fill deadline", |e| match e {
            ServerEvent::MatchFound { players, .. } => {
                assert_eq!(players.len(), 3);
                Some(())
            }
            _ => None,
        })
        .await;
    }
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_pairing_requeues_the_ready_player_at_the_head() {
    let arena = TestArena::start(Parameters::default()).await;
    let mut keen = arena.connect("keen", 1000).await;
    let mut flaky = arena.connect("flaky", 1010).await;

    keen.send(ClientCommand::FindMatch {
        mode: MatchMode::Ranked,
        preferences: Default::default(),
    })
    .await;
    flaky
        .send(ClientCommand::FindMatch {
            mode: MatchMode::Ranked,
            preferences: Default::default(),
        })
        .await;

    let match_id = keen
        .expect("first pairing", |e| match e {
            ServerEvent::MatchFound { match_id, .. } => Some(match_id),
            _ => None,
        })
        .await;
    flaky.drain().await;

    // Only one player confirms within the window.
    keen.send(ClientCommand::Ready { match_id }).await;
    advance_and_settle(Duration::from_secs(11)).await;

    let reason = keen
        .expect("pairing abandoned", |e| match e {
            ServerEvent::MatchEnd { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
    assert_eq!(
        reason,
        EndReason::Cancelled {
            reason: CancelReason::ConfirmTimeout
        }
    );

    // The confirmed player is back at the head and pairs with the next
    // compatible arrival.
    let mut fresh = arena.connect("fresh", 1005).await;
    fresh
        .send(ClientCommand::FindMatch {
            mode: MatchMode::Ranked,
            preferences: Default::default(),
        })
        .await;
    advance_and_settle(Duration::from_secs(1)).await;

    keen.expect("second pairing", |e| {
        matches!(e, ServerEvent::MatchFound { .. }).then_some(())
    })
    .await;
    fresh
        .expect("second pairing", |e| {
            matches!(e, ServerEvent::MatchFound { .. }).then_some(())
        })
        .await;
}
