// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use tokio::time::Instant;

/// Token bucket used for per-connection chat and typing limits. Purely
/// local state; no cross-process coordination.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket allowing `count` events per `window_secs`, with bursts up
    /// to `count`.
    pub fn per_window(count: u32, window_secs: u64, now: Instant) -> Self {
        let capacity = f64::from(count.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / window_secs.max(1) as f64,
            last_refill: now,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
