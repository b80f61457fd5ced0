// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;
use thiserror::Error;

use crate::base::{MatchId, PlayerId, RoundIndex, Version};
use crate::match_state::MatchStatus;
use crate::round::RoundStatus;

/// Errors that can occur while driving matches, pairing players, or talking
/// to the backing services.
#[derive(Clone, Debug, Error, IntoStaticStr)]
pub enum ArenaError {
    #[error("rejected: {0}")]
    Rejected(Reject),

    #[error("invalid match transition: {from:?} -> {to:?}")]
    InvalidTransition { from: MatchStatus, to: MatchStatus },

    #[error("invalid round transition: {from:?} -> {to:?} (round {round})")]
    InvalidRoundTransition {
        round: RoundIndex,
        from: RoundStatus,
        to: RoundStatus,
    },

    #[error("player {0} is not part of this match")]
    UnknownPlayer(PlayerId),

    #[error("duplicate player {0} in match roster")]
    DuplicatePlayer(PlayerId),

    #[error("no round at cursor {0}")]
    NoSuchRound(RoundIndex),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("lost snapshot ownership for {match_id} at version {version}")]
    OwnershipLost { match_id: MatchId, version: Version },

    #[error("grader failed: {0}")]
    GraderFailed(String),

    #[error("mailbox closed")]
    MailboxClosed,

    #[error("core is shutting down")]
    Shutdown,
}

pub type ArenaResult<T> = Result<T, ArenaError>;

#[macro_export]
macro_rules! bail {
    ($e:expr) => {
        return Err($e);
    };
}

#[macro_export(local_inner_macros)]
macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            bail!($e);
        }
    };
}

/// Machine-readable rejection codes surfaced to the offending connection
/// only. A rejection never affects match state.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidCommand,
    InvalidMode,
    InvalidLanguage,
    InvalidSubmission,
    MatchNotFound,
    MatchFull,
    PrivateDenied,
    NotInMatch,
    AlreadyInMatch,
    NotSpectating,
    NotOwner,
    WrongState,
    RateLimited,
    EmptyMessage,
    MessageTooLong,
    CapacityExhausted,
    Internal,
}

/// A command rejection: code plus a human-readable reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub code: ErrorCode,
    pub message: String,
}

impl Reject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn wrong_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WrongState, message)
    }

    pub fn not_in_match() -> Self {
        Self::new(ErrorCode::NotInMatch, "player is not part of this match")
    }

    pub fn match_not_found(match_id: MatchId) -> Self {
        Self::new(ErrorCode::MatchNotFound, format!("no such match {match_id}"))
    }
}

impl std::fmt::Display for Reject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code: &'static str = self.code.into();
        write!(f, "{code}: {}", self.message)
    }
}

impl From<Reject> for ArenaError {
    fn from(reject: Reject) -> Self {
        ArenaError::Rejected(reject)
    }
}
