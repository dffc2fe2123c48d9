//! Bounded retry with exponential backoff and a hard per-call timeout.
//!
//! Every call to an external collaborator (text generation, embedding,
//! speech synthesis, transcription) goes through [`call_with_retry`].

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use log::{error, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::{content_skip_reason, is_resource_failure, PipelineError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Delay multiplier applied after each failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Random spread applied to each delay, as a fraction of the delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Hard timeout for a single call
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    2000
}
fn default_max_delay() -> u64 {
    60000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.1
}
fn default_timeout() -> u64 {
    240
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl RetryPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        delay.mul_f64(factor)
    }
}

/// Runs `operation` until it succeeds or the policy gives up.
///
/// Each attempt is bounded by the policy timeout. On exhaustion the returned
/// error wraps a [`PipelineError::TransientRemote`] so callers can record a
/// unit-level failure without crashing the pipeline. Resource and content
/// errors are returned unchanged on the first occurrence.
pub async fn call_with_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let timeout = policy.timeout();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let outcome = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                operation: operation.to_string(),
                timeout,
            }
            .into()),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if is_resource_failure(&e) || content_skip_reason(&e).is_some() => {
                return Err(e)
            }
            Err(e) if attempt < max_attempts => {
                let delay = policy.jittered(policy.delay_for_attempt(attempt));
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {:#}",
                    operation, attempt, max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("{} failed after {} attempt(s): {:#}", operation, attempt, e);
                return Err(PipelineError::TransientRemote {
                    operation: operation.to_string(),
                    attempts: attempt,
                    message: format!("{:#}", e),
                }
                .into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
            timeout_seconds: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000));
    }

    #[test]
    fn test_policy_parses_from_yaml_with_defaults() {
        let policy: RetryPolicy = serde_yaml_ng::from_str("max_attempts: 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.timeout_seconds, 240);
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() -> Result<()> {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = call_with_retry("flaky", &fast_policy(3), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                anyhow::bail!("connection reset");
            }
            Ok(n)
        })
        .await?;

        assert_eq!(value, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhaustion_reports_transient_remote() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = call_with_retry("always failing", &fast_policy(2), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("rate limited")
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::TransientRemote { attempts, message, .. }) => {
                assert_eq!(*attempts, 2);
                assert!(message.contains("rate limited"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resource_failure_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = call_with_retry("model call", &fast_policy(3), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::resource("model failed to load").into())
        })
        .await;

        assert!(is_resource_failure(&result.unwrap_err()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_per_call() {
        let policy = RetryPolicy {
            timeout_seconds: 0,
            ..fast_policy(2)
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = call_with_retry("slow call", &policy, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(format!("{:#}", result.unwrap_err()).contains("timed out"));
    }
}
