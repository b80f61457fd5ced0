// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fundamental identifier and time types shared by every component.
//!
//! All identifiers are newtypes over UUIDs so they cannot be confused with
//! one another at call sites. Timestamps are milliseconds since the Unix
//! epoch, always produced by the arena clock (never by ad-hoc wall reads)
//! so that event ordering survives paused-time tests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Timestamp in milliseconds since the Unix epoch.
pub type TimestampMs = u64;

/// Index of a round within a match, starting at zero.
pub type RoundIndex = u32;

/// Monotonic version of a match aggregate. Incremented on every mutation;
/// snapshots are compare-and-set on this value.
pub type Version = u64;

/// Player skill rating used for matchmaking compatibility.
pub type Rating = u32;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Short, human-friendly form used in logs and lobby codes.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        /// Full round-trippable form: prefix plus the 32-hex uuid.
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0.simple())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.short())
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix($prefix).unwrap_or(s);
                Uuid::from_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identity of an authenticated principal for the duration of a session.
    PlayerId,
    "p-"
);
uuid_id!(
    /// Identity of a single arena session (one set of players and rounds).
    MatchId,
    "m-"
);
uuid_id!(
    /// Identity of one accepted solution upload.
    SubmissionId,
    "s-"
);
uuid_id!(
    /// Identity of one duplex connection; a player may hold several.
    ConnectionId,
    "c-"
);
uuid_id!(
    /// Identity of a matchmaking ticket.
    TicketId,
    "t-"
);

/// Identity of a problem served for a round. Opaque to the core.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProblemId(pub String);

impl fmt::Display for ProblemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ProblemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProblemId({})", self.0)
    }
}

impl From<&str> for ProblemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
