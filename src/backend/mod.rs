use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{BackendError, ErrorKind};

pub mod gemini;

/// Capability boundary to the generative image provider. The orchestrator
/// only ever sees this trait, so tests substitute scripted implementations.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Text-to-image generation from a full standalone prompt.
    async fn generate(&self, prompt: &str, seed: i64) -> Result<Vec<u8>, BackendError>;

    /// Edit-conditioned generation: keeps the base image's identity while
    /// applying the prompt's expression change.
    async fn edit_from(
        &self,
        base: &[u8],
        prompt: &str,
        seed: i64,
    ) -> Result<Vec<u8>, BackendError>;
}

/// Bounded exponential backoff. Whether a failure is retried depends only on
/// its [`ErrorKind`], never on the underlying failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn should_retry(&self, kind: ErrorKind, attempts_made: usize) -> bool {
        kind == ErrorKind::Transient && attempts_made < self.max_attempts
    }

    pub fn delay(&self, attempts_made: usize) -> Duration {
        let shift = attempts_made.saturating_sub(1).min(8) as u32;
        self.base_delay.saturating_mul(1 << shift)
    }
}

/// Runs `call` until it succeeds or the policy declines another attempt.
pub async fn call_with_retry<F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    call: F,
) -> Result<Vec<u8>, BackendError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Vec<u8>, BackendError>>,
{
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        match call().await {
            Ok(bytes) => return Ok(bytes),
            Err(err) => {
                let retrying = policy.should_retry(err.kind, attempts);
                warn!(
                    "{operation} failed (kind={}, attempt={}/{}, retrying={}): {}",
                    err.kind, attempts, policy.max_attempts, retrying, err.message
                );
                if !retrying {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay(attempts)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(0),
        }
    }

    #[test]
    fn permanent_errors_are_never_retried() {
        let policy = policy();
        assert!(!policy.should_retry(ErrorKind::Permanent, 1));
        assert!(policy.should_retry(ErrorKind::Transient, 1));
        assert!(!policy.should_retry(ErrorKind::Transient, 3));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicUsize::new(0);
        let result = call_with_retry(&policy(), "test call", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BackendError::transient("timeout"))
                } else {
                    Ok(vec![1u8])
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), vec![1u8]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let calls = AtomicUsize::new(0);
        let result = call_with_retry(&policy(), "test call", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<Vec<u8>, _>(BackendError::permanent("invalid api key")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
