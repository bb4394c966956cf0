//! Retry with exponential backoff and jitter.
//!
//! Nothing in the provisioning path retries on its own. Callers that opt in
//! (the lifecycle manager's workflow policy) wrap an operation here and pick
//! which failures are worth another attempt.
//!
//! ```ignore
//! use kenv_common::retry::{retry_with_backoff_when, RetryConfig};
//!
//! let outputs = retry_with_backoff_when(
//!     &RetryConfig::with_max_attempts(3),
//!     "provision",
//!     |e: &Error| e.is_retryable(),
//!     || orchestrator.provision(&env_id, &vars),
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff policy for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    /// A single attempt: failures surface immediately.
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that never retries
    pub fn none() -> Self {
        Self::default()
    }

    /// Create a config that retries forever
    pub fn infinite() -> Self {
        Self::with_max_attempts(0)
    }

    /// True when a failure on `attempt` (1-based) leaves no attempts
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    /// True when this policy allows more than one attempt
    pub fn retries_enabled(&self) -> bool {
        self.max_attempts != 1
    }
}

/// Execute an async operation with exponential backoff and jitter, retrying
/// only the failures `should_retry` accepts.
pub async fn retry_with_backoff_when<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                if config.is_exhausted(attempt) {
                    if config.retries_enabled() {
                        error!(
                            operation = %operation_name,
                            attempt = attempt,
                            error = %e,
                            "Operation failed after max retries"
                        );
                    }
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_default_policy_makes_one_attempt() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_with_backoff_when(&RetryConfig::default(), "op", |_| true, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("boom")
                }
            })
            .await;

        assert_eq!(result, Err("boom"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!RetryConfig::none().retries_enabled());
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_with_backoff_when(&fast(5), "op", |_| true, || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("fail")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_with_backoff_when(&fast(3), "op", |_| true, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("always fails")
                }
            })
            .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failures_stop_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_with_backoff_when(&fast(5), "op", |e| *e != "permanent", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("permanent")
                }
            })
            .await;

        assert_eq!(result, Err("permanent"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
