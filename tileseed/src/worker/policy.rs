//! Retry policy for cache manager calls made by pool workers.
//!
//! Upstream fetches fail transiently (timeouts, 5xx responses). A seed work
//! item retries its load according to a [`RetryPolicy`]; cleanup items never
//! retry because removal is local.

use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default number of attempts for seed work items.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay after the first failure (200ms).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 200;

/// Default upper bound on the backoff delay (10 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 10;

/// Default factor applied to the delay after each failure.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// How many times, and how patiently, a failing call is repeated.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// Single attempt.
    None,

    /// Constant delay between attempts.
    Fixed {
        /// Attempts including the first one.
        max_attempts: u32,
        delay: Duration,
    },

    /// Delay grows by `multiplier` after each failure, capped at `max_delay`.
    ExponentialBackoff {
        /// Attempts including the first one.
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// Exponential backoff with the default delays.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Delay before retry number `attempt` (1-based), `None` once the
    /// attempts are used up.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { delay, .. } => Some(*delay),
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let factor = multiplier.powi((attempt - 1) as i32);
                let secs = (initial_delay.as_secs_f64() * factor).min(max_delay.as_secs_f64());
                Some(Duration::from_secs_f64(secs))
            }
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => (*max_attempts).max(1),
            Self::ExponentialBackoff { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Runs `op` until it succeeds, the attempts are used up, or `cancel`
    /// fires during a backoff pause. Returns the last result and the number
    /// of attempts made.
    pub fn run<T, E>(
        &self,
        cancel: &CancellationToken,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> (Result<T, E>, u32) {
        let mut attempt = 1;
        loop {
            let result = op();
            if result.is_ok() {
                return (result, attempt);
            }
            match self.delay_for_attempt(attempt) {
                Some(delay) if !cancel.is_cancelled() => {
                    thread::sleep(delay);
                    attempt += 1;
                }
                _ => return (result, attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_exponential() {
        assert_eq!(RetryPolicy::default().max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert!(matches!(
            RetryPolicy::default(),
            RetryPolicy::ExponentialBackoff { .. }
        ));
    }

    #[test]
    fn test_none_never_retries() {
        assert_eq!(RetryPolicy::None.max_attempts(), 1);
        assert_eq!(RetryPolicy::None.delay_for_attempt(1), None);
    }

    #[test]
    fn test_fixed_delays() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(50)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(50)));
        assert_eq!(policy.delay_for_attempt(3), None);
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = RetryPolicy::ExponentialBackoff {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for_attempt(4), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_run_retries_until_success() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let mut calls = 0;
        let (result, attempts) = policy.run(&CancellationToken::new(), || {
            calls += 1;
            if calls < 2 {
                Err("transient")
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_run_gives_up() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let (result, attempts) =
            policy.run::<(), _>(&CancellationToken::new(), || Err("down"));
        assert_eq!(result, Err("down"));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_run_stops_retrying_when_cancelled() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (result, attempts) = policy.run::<(), _>(&cancel, || Err("down"));
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
