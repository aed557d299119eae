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

use rand::Rng;
use std::cmp;
use std::time::{Duration, Instant};

const YOUNG_ATTEMPT: Duration = Duration::from_secs(2);
const YOUNG_WINDOW: Duration = Duration::from_millis(100);
const WINDOW_CAP: Duration = Duration::from_millis(2_000);

/// Randomized polling backoff for possession waits.
///
/// The window starts at 100 ms for attempts younger than two seconds and
/// then grows as one tenth of the attempt's age, capped at two seconds.
/// Each sleep is drawn uniformly from `[window/2, window]` so that
/// competing lockers do not fall into lockstep rescans.
#[derive(Debug, Clone)]
pub struct PollingBackoff {
    started_at: Instant,
}

impl PollingBackoff {
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    pub fn with_start(started_at: Instant) -> Self {
        Self { started_at }
    }

    /// Current full window, before jitter.
    pub fn window(&self) -> Duration {
        let age = self.started_at.elapsed();
        if age < YOUNG_ATTEMPT {
            YOUNG_WINDOW
        } else {
            cmp::min(age / 10, WINDOW_CAP)
        }
    }

    /// Next randomized sleep.
    pub fn next_delay(&self) -> Duration {
        let window = self.window();
        let ceiling = window.as_millis() as u64;
        let floor = ceiling / 2;
        Duration::from_millis(rand::thread_rng().gen_range(floor..=ceiling))
    }
}

impl Default for PollingBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn young_attempts_use_the_short_window() {
        let backoff = PollingBackoff::new();
        assert_eq!(backoff.window(), Duration::from_millis(100));
        for _ in 0..64 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(100), "{delay:?}");
        }
    }

    #[test]
    fn window_grows_with_attempt_age() {
        let Some(started) = Instant::now().checked_sub(Duration::from_secs(5)) else {
            return; // monotonic clock too young to backdate
        };
        let backoff = PollingBackoff::with_start(started);
        let window = backoff.window();
        assert!(window >= Duration::from_millis(500), "{window:?}");
        assert!(window < Duration::from_millis(600), "{window:?}");
    }

    #[test]
    fn window_is_capped_for_old_attempts() {
        let Some(started) = Instant::now().checked_sub(Duration::from_secs(600)) else {
            return;
        };
        let backoff = PollingBackoff::with_start(started);
        assert_eq!(backoff.window(), Duration::from_millis(2_000));
        for _ in 0..64 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(1_000), "{delay:?}");
            assert!(delay <= Duration::from_millis(2_000), "{delay:?}");
        }
    }
}
