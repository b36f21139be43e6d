//! Per-endpoint rate accounting.
//!
//! A sliding 60-second window of call timestamps, not a token bucket: the
//! accountant only remembers *when* calls happened and answers "would one
//! more call right now exceed the endpoint's caps". Callers supply the caps
//! (`max_tps`, `max_tpm`) from the endpoint's current identity on every call,
//! so a config reload that changes an endpoint's limits takes effect
//! immediately without resetting its call history.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct RateAccountant {
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = timestamps.front() {
            if now.saturating_duration_since(front) > WINDOW {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Would a call placed `now` stay within `max_tps` (over the trailing
    /// second) and `max_tpm` (over the trailing 60s)?
    pub fn can_send(&self, now: Instant, max_tps: u32, max_tpm: Option<u32>) -> bool {
        let mut ts = self.timestamps.lock();
        Self::prune(&mut ts, now);

        let count_1s = ts
            .iter()
            .rev()
            .take_while(|&&t| now.saturating_duration_since(t) < SECOND)
            .count();
        if count_1s as u32 >= max_tps {
            return false;
        }

        if let Some(cap) = max_tpm {
            if ts.len() as u32 >= cap {
                return false;
            }
        }

        true
    }

    /// Record a call made at `now`.
    pub fn record(&self, now: Instant) {
        let mut ts = self.timestamps.lock();
        ts.push_back(now);
        Self::prune(&mut ts, now);
    }

    /// Number of calls recorded within `window` of `now` (used for
    /// observed-tps/observed-tpm metrics and throttle detection).
    pub fn count_within(&self, now: Instant, window: Duration) -> usize {
        let mut ts = self.timestamps.lock();
        Self::prune(&mut ts, now);
        ts.iter()
            .rev()
            .take_while(|&&t| now.saturating_duration_since(t) < window)
            .count()
    }

    /// Earliest instant at which a new call would no longer exceed either
    /// cap, used by the balancer to decide how long to sleep before
    /// re-selecting.
    pub fn earliest_available(&self, now: Instant, max_tps: u32, max_tpm: Option<u32>) -> Instant {
        let ts = self.timestamps.lock();

        let one_sec_ago = now.checked_sub(SECOND).unwrap_or(now);
        let in_window: Vec<Instant> = ts
            .iter()
            .rev()
            .take_while(|&&t| t > one_sec_ago)
            .copied()
            .collect();

        let mut candidates = Vec::new();
        if in_window.len() as u32 >= max_tps {
            if let Some(&oldest_in_window) = in_window.last() {
                candidates.push(oldest_in_window + SECOND);
            }
        }

        if let Some(cap) = max_tpm {
            if ts.len() as u32 >= cap {
                if let Some(&oldest) = ts.front() {
                    candidates.push(oldest + WINDOW);
                }
            }
        }

        candidates.into_iter().min().unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn allows_calls_under_cap() {
        let accountant = RateAccountant::new();
        let now = Instant::now();
        assert!(accountant.can_send(now, 3, None));
        accountant.record(now);
        accountant.record(now);
        assert!(accountant.can_send(now, 3, None));
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_once_tps_cap_reached() {
        let accountant = RateAccountant::new();
        let now = Instant::now();
        accountant.record(now);
        accountant.record(now);
        assert!(!accountant.can_send(now, 2, None));
    }

    #[tokio::test(start_paused = true)]
    async fn tps_window_clears_after_one_second() {
        let accountant = RateAccountant::new();
        let now = Instant::now();
        accountant.record(now);
        accountant.record(now);
        assert!(!accountant.can_send(now, 2, None));

        tokio::time::advance(Duration::from_millis(1001)).await;
        let later = Instant::now();
        assert!(accountant.can_send(later, 2, None));
    }

    #[tokio::test(start_paused = true)]
    async fn tpm_cap_independent_of_tps() {
        let accountant = RateAccountant::new();
        let now = Instant::now();
        for _ in 0..5 {
            accountant.record(now);
            tokio::time::advance(Duration::from_millis(1100)).await;
        }
        let now = Instant::now();
        assert!(!accountant.can_send(now, 100, Some(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_available_is_roughly_one_second_out() {
        let accountant = RateAccountant::new();
        let now = Instant::now();
        accountant.record(now);
        let retry_at = accountant.earliest_available(now, 1, None);
        assert_eq!(retry_at, now + SECOND);
    }
}
