// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! Real-time match orchestration core.
//!
//! The process hosts three cooperating subsystems behind one
//! [`node::ArenaNode`]:
//!
//! - the [`hub::SessionHub`], owning the connection/player/match mapping
//!   and all outbound fan-out;
//! - the [`matchmaker::Matchmaker`], a queueing and pairing actor;
//! - the [`supervisor::Supervisor`], spawning one single-writer
//!   [`runtime`] task per match.
//!
//! Transport, authentication, durable storage, grading and sandboxed
//! execution all live outside this crate behind narrow interfaces.

pub mod clock;
pub mod hub;
pub mod matchmaker;
pub mod node;
pub mod runtime;
pub mod supervisor;
mod throttle;

pub use clock::Clock;
pub use hub::{outbound_channel, SessionHub};
pub use matchmaker::MatchmakerHandle;
pub use node::ArenaNode;
pub use supervisor::{Routes, SupervisorHandle};
