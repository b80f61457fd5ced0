// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::SystemTime;

use tokio::time::{Duration, Instant};

use types::TimestampMs;

/// Monotonic clock for the whole core.
///
/// The wall clock is read exactly once, at construction; every timestamp
/// afterwards is derived from the tokio instant stream, which both keeps
/// event ordering monotonic and lets tests drive time deterministically
/// with `tokio::time::advance`. Deadlines are always absolute instants
/// computed up front, so a busy runtime does not drift them.
///
/// Deliberately not cloneable: a single instance is shared behind an
/// `Arc` so every component agrees on the origin.
pub struct Clock {
    origin: Instant,
    origin_ms: TimestampMs,
}

impl Clock {
    pub fn new() -> Self {
        let origin = Instant::now();
        let origin_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as TimestampMs)
            .unwrap_or(0);
        Self { origin, origin_ms }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Current time as a Unix timestamp in milliseconds, monotonic with
    /// respect to [`Clock::now`].
    pub fn timestamp_ms(&self) -> TimestampMs {
        self.timestamp_at(Instant::now())
    }

    pub fn timestamp_at(&self, instant: Instant) -> TimestampMs {
        self.origin_ms
            + instant
                .saturating_duration_since(self.origin)
                .as_millis() as TimestampMs
    }

    /// Map a timestamp back onto the monotonic timeline. Timestamps
    /// before the process origin clamp to the origin.
    pub fn instant_at(&self, ts: TimestampMs) -> Instant {
        self.origin + Duration::from_millis(ts.saturating_sub(self.origin_ms))
    }

    /// Absolute deadline a duration from now.
    pub fn deadline_after(&self, after: Duration) -> Instant {
        Instant::now() + after
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
