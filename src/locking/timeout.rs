// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::time::{Duration, Instant};

/// Millisecond sentinel requesting a single non-blocking attempt.
pub const TRYLOCK_WAIT: u32 = 0;

/// Millisecond sentinel requesting an unbounded wait.
pub const INFINITE_WAIT: u32 = u32::MAX;

/// Resolved wait budget for one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitLimit {
    /// Fail immediately on any contention.
    TryOnce,
    Finite(Duration),
    Infinite,
}

impl WaitLimit {
    /// Maps the wire-level millisecond value onto a limit: `0` is try-once
    /// and `0xFFFFFFFF` waits forever.
    pub fn from_millis(millis: u32) -> Self {
        match millis {
            TRYLOCK_WAIT => WaitLimit::TryOnce,
            INFINITE_WAIT => WaitLimit::Infinite,
            bounded => WaitLimit::Finite(Duration::from_millis(u64::from(bounded))),
        }
    }

    pub fn is_try_once(&self) -> bool {
        matches!(self, WaitLimit::TryOnce)
    }
}

impl fmt::Display for WaitLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitLimit::TryOnce => f.write_str("try-once"),
            WaitLimit::Infinite => f.write_str("infinite"),
            WaitLimit::Finite(duration) => write!(f, "{}ms", duration.as_millis()),
        }
    }
}

/// Tracks elapsed and remaining time for a wait budget.
#[derive(Debug, Clone)]
pub struct WaitBudget {
    limit: WaitLimit,
    started_at: Instant,
}

impl WaitBudget {
    pub fn new(limit: WaitLimit) -> Self {
        Self {
            limit,
            started_at: Instant::now(),
        }
    }

    pub fn with_start(limit: WaitLimit, started_at: Instant) -> Self {
        Self { limit, started_at }
    }

    pub fn limit(&self) -> WaitLimit {
        self.limit
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether any further waiting is allowed. A try-once budget is spent
    /// the moment contention is observed.
    pub fn is_expired(&self) -> bool {
        match self.limit {
            WaitLimit::TryOnce => true,
            WaitLimit::Infinite => false,
            WaitLimit::Finite(limit) => self.elapsed() >= limit,
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self.limit {
            WaitLimit::TryOnce => Some(Duration::ZERO),
            WaitLimit::Infinite => None,
            WaitLimit::Finite(limit) => Some(limit.saturating_sub(self.elapsed())),
        }
    }

    /// Clamps a proposed sleep to what the budget still allows.
    pub fn clamp_sleep(&self, proposed: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => proposed.min(remaining),
            None => proposed,
        }
    }
}

/// Parses a wait override originating from the CLI: a number of
/// milliseconds or the word `infinite`.
pub fn parse_wait_override(value: &str) -> Result<u32, String> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("infinite") {
        return Ok(INFINITE_WAIT);
    }

    trimmed.parse::<u32>().map_err(|_| {
        format!(
            "Wait value '{trimmed}' is invalid. Use a number of milliseconds or the word \
             'infinite'."
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_millis_map_to_limits() {
        assert_eq!(WaitLimit::from_millis(0), WaitLimit::TryOnce);
        assert_eq!(WaitLimit::from_millis(u32::MAX), WaitLimit::Infinite);
        assert_eq!(
            WaitLimit::from_millis(3_500),
            WaitLimit::Finite(Duration::from_millis(3_500))
        );
    }

    #[test]
    fn try_once_budget_is_always_expired() {
        let budget = WaitBudget::new(WaitLimit::TryOnce);
        assert!(budget.is_expired());
        assert_eq!(budget.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn infinite_budget_never_expires() {
        let Some(past) = Instant::now().checked_sub(Duration::from_secs(3_600)) else {
            return; // monotonic clock too young to backdate
        };
        let budget = WaitBudget::with_start(WaitLimit::Infinite, past);
        assert!(!budget.is_expired());
        assert_eq!(budget.remaining(), None);
    }

    #[test]
    fn finite_budget_expires_after_limit() {
        let Some(past) = Instant::now().checked_sub(Duration::from_millis(50)) else {
            return;
        };
        let budget = WaitBudget::with_start(
            WaitLimit::Finite(Duration::from_millis(10)),
            past,
        );
        assert!(budget.is_expired());

        let fresh = WaitBudget::new(WaitLimit::Finite(Duration::from_secs(60)));
        assert!(!fresh.is_expired());
    }

    #[test]
    fn sleep_is_clamped_to_remaining_budget() {
        let budget = WaitBudget::new(WaitLimit::Finite(Duration::from_millis(40)));
        let clamped = budget.clamp_sleep(Duration::from_secs(5));
        assert!(clamped <= Duration::from_millis(40));

        let unbounded = WaitBudget::new(WaitLimit::Infinite);
        assert_eq!(
            unbounded.clamp_sleep(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn parse_accepts_millis_and_infinite() {
        assert_eq!(parse_wait_override("250"), Ok(250));
        assert_eq!(parse_wait_override("Infinite"), Ok(INFINITE_WAIT));
        assert_eq!(parse_wait_override("0"), Ok(TRYLOCK_WAIT));
        assert!(parse_wait_override("soon").is_err());
    }
}
