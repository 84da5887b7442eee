use std::fmt::Display;

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::logging::{log, obj, v_num, v_str, Domain, Level};

/// Retry configuration for backend commits.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Policy with no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, base_delay_ms: 0, max_delay_ms: 0, jitter_factor: 0.0 }
    }

    /// Exponential backoff with jitter; `attempt` is zero-based.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Final failure of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
    /// False when the loop stopped on an error the predicate refused to retry.
    pub retryable: bool,
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the
/// policy's attempts are spent. Returns the value and the attempts used.
pub async fn retry_with_backoff<F, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok((value, attempt + 1)),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(RetryError { attempts: attempt + 1, last: e, retryable: false });
                }
                if attempt + 1 >= max_attempts {
                    return Err(RetryError { attempts: attempt + 1, last: e, retryable: true });
                }
                let delay = policy.delay_for_attempt(attempt);
                log(
                    Level::Warn,
                    Domain::Store,
                    "retry",
                    obj(&[
                        ("operation", v_str(operation_name)),
                        ("attempt", v_num((attempt + 1) as f64)),
                        ("max_attempts", v_num(max_attempts as f64)),
                        ("error", v_str(&e.to_string())),
                        ("delay_ms", v_num(delay.as_millis() as f64)),
                    ]),
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000)); // clamped
    }

    #[tokio::test]
    async fn test_retry_success_first_try() {
        let policy = RetryPolicy::default();
        let result: Result<(i32, u32), RetryError<String>> =
            retry_with_backoff(&policy, "test", |_| true, || Ok(42)).await;
        assert_eq!(result.unwrap(), (42, 1));
    }

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let policy = RetryPolicy { base_delay_ms: 1, ..RetryPolicy::default() };
        let mut calls = 0;
        let result = retry_with_backoff(&policy, "test", |_: &String| true, || {
            calls += 1;
            if calls < 3 {
                Err("busy".to_string())
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), (7, 3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_reports_last_error() {
        let policy = RetryPolicy::immediate(3);
        let mut calls = 0;
        let result: Result<((), u32), _> = retry_with_backoff(&policy, "test", |_: &String| true, || {
            calls += 1;
            Err(format!("busy {}", calls))
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, "busy 3");
        assert!(err.retryable);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;
        let result: Result<((), u32), _> = retry_with_backoff(&policy, "test", |e: &String| e != "fatal", || {
            calls += 1;
            Err("fatal".to_string())
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(!err.retryable);
        assert_eq!(calls, 1);
    }
}
