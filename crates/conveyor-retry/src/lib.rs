//! Backoff strategies for conveyor.
//!
//! Conveyor never retries a publish job in-process: a failed job goes back
//! to the broker. Retries here cover the plumbing around the pipeline, chiefly
//! (re)establishing the broker connection when a worker starts.
//!
//! # Example
//!
//! ```
//! use conveyor_retry::{Backoff, BackoffKind, delay_for_attempt};
//! use std::time::Duration;
//!
//! let backoff = Backoff {
//!     kind: BackoffKind::Exponential,
//!     max_attempts: 5,
//!     base_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(30),
//!     jitter: 0.0,
//! };
//! assert_eq!(delay_for_attempt(&backoff, 3), Duration::from_secs(4));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Retry right away.
    Immediate,
    /// Double the delay on every attempt.
    #[default]
    Exponential,
    /// Grow the delay by `base_delay` on every attempt.
    Linear,
    /// Always wait `base_delay`.
    Constant,
}

/// Retry schedule for a fallible operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default, rename = "strategy")]
    pub kind: BackoffKind,
    /// Total number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Randomization factor: 0.0 disables jitter, 0.5 spreads the delay over
    /// `[0.5 * d, 1.5 * d]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Delay to wait after the given failed attempt (1-indexed).
pub fn delay_for_attempt(backoff: &Backoff, attempt: u32) -> Duration {
    let delay = match backoff.kind {
        BackoffKind::Immediate => Duration::ZERO,
        BackoffKind::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            backoff.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffKind::Linear => backoff.base_delay.saturating_mul(attempt.max(1)),
        BackoffKind::Constant => backoff.base_delay,
    };

    let capped = delay.min(backoff.max_delay);

    if backoff.jitter > 0.0 {
        jittered(capped, backoff.jitter.min(1.0))
    } else {
        capped
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let sample: f64 = rand::rng().random();
    let factor = 1.0 - jitter + sample * 2.0 * jitter;
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

/// A failed attempt, handed to the observer before the next sleep.
#[derive(Debug)]
pub struct FailedAttempt<'a, E> {
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: &'a E,
    /// `None` when no further attempt will be made.
    pub next_delay: Option<Duration>,
}

/// Runs an operation until it succeeds or the schedule is exhausted.
#[derive(Debug, Clone)]
pub struct Retrier {
    backoff: Backoff,
}

impl Retrier {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    /// Run `operation`, sleeping between failed attempts and calling
    /// `observe` after each one.
    ///
    /// The operation receives the current attempt number (starting at 1).
    /// The last error is returned once `max_attempts` is reached.
    pub fn run_observed<T, E, F, O>(&self, mut operation: F, mut observe: O) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        O: FnMut(FailedAttempt<'_, E>),
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= max_attempts {
                        observe(FailedAttempt {
                            attempt,
                            max_attempts,
                            error: &error,
                            next_delay: None,
                        });
                        return Err(error);
                    }

                    let delay = delay_for_attempt(&self.backoff, attempt);
                    observe(FailedAttempt {
                        attempt,
                        max_attempts,
                        error: &error,
                        next_delay: Some(delay),
                    });
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(kind: BackoffKind, base: u64, max: u64) -> Backoff {
        Backoff {
            kind,
            max_attempts: 10,
            base_delay: Duration::from_secs(base),
            max_delay: Duration::from_secs(max),
            jitter: 0.0,
        }
    }

    fn instant(max_attempts: u32) -> Backoff {
        Backoff {
            kind: BackoffKind::Immediate,
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    #[test]
    fn immediate_never_waits() {
        let backoff = fixed(BackoffKind::Immediate, 1, 60);
        assert_eq!(delay_for_attempt(&backoff, 1), Duration::ZERO);
        assert_eq!(delay_for_attempt(&backoff, 7), Duration::ZERO);
    }

    #[test]
    fn exponential_doubles_until_cap() {
        let backoff = fixed(BackoffKind::Exponential, 1, 60);
        assert_eq!(delay_for_attempt(&backoff, 1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&backoff, 2), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&backoff, 3), Duration::from_secs(4));
        assert_eq!(delay_for_attempt(&backoff, 10), Duration::from_secs(60));
    }

    #[test]
    fn linear_and_constant() {
        let linear = fixed(BackoffKind::Linear, 2, 7);
        assert_eq!(delay_for_attempt(&linear, 1), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&linear, 3), Duration::from_secs(6));
        assert_eq!(delay_for_attempt(&linear, 4), Duration::from_secs(7));

        let constant = fixed(BackoffKind::Constant, 3, 60);
        assert_eq!(delay_for_attempt(&constant, 1), Duration::from_secs(3));
        assert_eq!(delay_for_attempt(&constant, 9), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_in_band() {
        let backoff = Backoff {
            jitter: 0.5,
            ..fixed(BackoffKind::Constant, 10, 60)
        };
        for _ in 0..100 {
            let delay = delay_for_attempt(&backoff, 1);
            assert!(delay >= Duration::from_millis(5000));
            assert!(delay <= Duration::from_millis(15000));
        }
    }

    #[test]
    fn retrier_returns_first_success() {
        let mut calls = 0;
        let result = Retrier::new(instant(5)).run_observed(
            |attempt| {
                calls = attempt;
                if attempt < 3 { Err("refused") } else { Ok("connected") }
            },
            |_| {},
        );
        assert_eq!(result, Ok("connected"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn retrier_gives_up_after_max_attempts() {
        let mut seen = Vec::new();
        let result: Result<(), _> = Retrier::new(instant(3)).run_observed(
            |_| Err("refused"),
            |failed| seen.push((failed.attempt, failed.next_delay.is_some())),
        );
        assert_eq!(result, Err("refused"));
        assert_eq!(seen, vec![(1, true), (2, true), (3, false)]);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _ = Retrier::new(instant(0)).run_observed(
            |_| {
                calls += 1;
                Err::<(), _>("refused")
            },
            |_| {},
        );
        assert_eq!(calls, 1);
    }

    proptest::proptest! {
        #[test]
        fn unjittered_delay_never_exceeds_cap(
            base_ms in 1u64..10_000,
            max_ms in 100u64..300_000,
            attempt in 1u32..100,
        ) {
            let backoff = Backoff {
                kind: BackoffKind::Exponential,
                max_attempts: 100,
                base_delay: Duration::from_millis(base_ms.min(max_ms)),
                max_delay: Duration::from_millis(max_ms),
                jitter: 0.0,
            };
            proptest::prop_assert!(delay_for_attempt(&backoff, attempt) <= backoff.max_delay);
        }
    }

    #[test]
    fn backoff_reads_humantime_durations() {
        let backoff: Backoff = serde_json::from_str(
            r#"{"strategy":"linear","max_attempts":4,"base_delay":"500ms","max_delay":"1m"}"#,
        )
        .expect("parse");
        assert_eq!(backoff.kind, BackoffKind::Linear);
        assert_eq!(backoff.max_attempts, 4);
        assert_eq!(backoff.base_delay, Duration::from_millis(500));
        assert_eq!(backoff.max_delay, Duration::from_secs(60));
        assert_eq!(backoff.jitter, 0.2);
    }
}
