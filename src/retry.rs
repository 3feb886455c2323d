//! Retry policy: a pure function from `(attempt, elapsed)` to a decision.
//!
//! Classification decides *whether* a failure is worth consulting the policy
//! for; the policy itself only does arithmetic: geometric backoff with an
//! optional ±10% jitter band and a cumulative-elapsed cutoff.

use std::time::Duration;

/// What the transaction executor (or any other retry-driving caller) should
/// do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Wait this long, then retry.
    RetryAfter(Duration),
    /// Stop; surface the last classified error to the caller.
    GiveUp,
}

/// Immutable retry policy, copied into the pool at construction.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts are counted from 0; `max_attempts` is the total number of
    /// tries allowed (so `max_attempts = 3` means up to 2 retries).
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// If set, cumulative time spent (attempts + backoffs) beyond this
    /// forces a give-up regardless of `max_attempts`.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
            max_elapsed: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// `next_delay = min(max_backoff, base_backoff * multiplier^attempt) [+ jitter]`.
    /// `attempt` is 0-based: the first retry (attempt 0) waits `base_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff.as_secs_f64() * 1000.0;
        let scaled_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = scaled_ms.min(self.max_backoff.as_secs_f64() * 1000.0);
        let jittered_ms = if self.jitter {
            let factor = 0.9 + rand::random::<f64>() * 0.2; // ±10%
            capped_ms * factor
        } else {
            capped_ms
        };
        Duration::from_secs_f64((jittered_ms.max(0.0)) / 1000.0)
    }

    /// Decides whether attempt number `attempt` (0-based, the attempt that
    /// just failed) may be retried given `elapsed` time spent so far.
    pub fn decide(&self, attempt: u32, elapsed: Duration) -> RetryDecision {
        if attempt + 1 >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        if let Some(max_elapsed) = self.max_elapsed {
            if elapsed >= max_elapsed {
                return RetryDecision::GiveUp;
            }
        }
        RetryDecision::RetryAfter(self.backoff_for(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_jitter_matches_exact_geometric_series() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
            max_elapsed: None,
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(1));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(2));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(4));
    }

    #[test]
    fn backoff_is_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(150),
            multiplier: 4.0,
            jitter: false,
            max_elapsed: None,
        };
        assert_eq!(policy.backoff_for(5), Duration::from_millis(150));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.decide(0, Duration::ZERO), RetryDecision::RetryAfter(policy.backoff_for(0)));
        assert_eq!(policy.decide(1, Duration::ZERO), RetryDecision::GiveUp);
    }

    #[test]
    fn gives_up_once_max_elapsed_exceeded() {
        let policy = RetryPolicy {
            max_attempts: 100,
            max_elapsed: Some(Duration::from_millis(10)),
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.decide(0, Duration::from_millis(11)), RetryDecision::GiveUp);
    }

    #[test]
    fn jitter_stays_within_ten_percent_band() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 1.0,
            jitter: true,
            max_elapsed: None,
        };
        for _ in 0..50 {
            let delay = policy.backoff_for(0).as_secs_f64() * 1000.0;
            assert!((90.0..=110.0).contains(&delay), "delay {delay} out of band");
        }
    }
}
