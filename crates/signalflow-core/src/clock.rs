// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time source for commit timestamps and checkpoint watermarks.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::value::{Timestamp, truncate_micros};

/// Source of "now".
pub trait Clock: Send + Sync {
    /// Current time, truncated to microseconds.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        truncate_micros(Utc::now())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Create a clock stopped at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(truncate_micros(start)),
        }
    }

    /// Jump to `ts`.
    pub fn set(&self, ts: Timestamp) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = truncate_micros(ts);
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_default();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::from_micros;

    #[test]
    fn test_manual_clock_moves_on_demand() {
        let clock = ManualClock::new(from_micros(1_000_000));
        assert_eq!(clock.now(), from_micros(1_000_000));
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), from_micros(2_500_000));
        clock.set(from_micros(42));
        assert_eq!(clock.now(), from_micros(42));
    }

    #[test]
    fn test_system_clock_is_microsecond_precise() {
        let now = SystemClock.now();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000, 0);
    }
}
