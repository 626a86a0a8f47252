//! Reconnect with exponential backoff

use std::time::Duration;
use tracing::warn;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            ..Self::default()
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Always makes at least one attempt. Returns the first success, or the
/// last error once `policy.attempts` have failed.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, attempts, e
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_connects_first_try() {
        let result: Result<&str, String> =
            retry_with_backoff("connect", &quick(3), || async { Ok("up") }).await;
        assert_eq!(result.unwrap(), "up");
    }

    #[tokio::test]
    async fn test_connects_after_refusals() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let result: Result<&str, String> = retry_with_backoff("connect", &quick(3), move || {
            let counter = counter_clone.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                if n < 2 {
                    Err(format!("refused #{}", n))
                } else {
                    Ok("up")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "up");
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let result: Result<(), String> = retry_with_backoff("connect", &quick(0), move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Err("no listener".to_string())
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), "no listener");
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
