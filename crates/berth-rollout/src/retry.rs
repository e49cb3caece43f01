//! Bounded retry with exponential backoff and a per-attempt deadline.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use berth_core::RetryConfig;

use crate::error::CollaboratorError;

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Failed(String),
    TimedOut(Duration),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(msg) => f.write_str(msg),
            AttemptError::TimedOut(after) => write!(f, "timed out after {} ms", after.as_millis()),
        }
    }
}

/// Every attempt failed; `last` is the final attempt's error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: AttemptError,
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached.
///
/// `op` receives the 1-based attempt number. Each attempt is bounded by
/// `deadline`; between attempts the task sleeps for `policy.backoff(n)`.
/// `on_retry` is called before each sleep. Returns the value and the number
/// of attempts used.
pub async fn retry_with_backoff<T, F, Fut, R>(
    policy: &RetryConfig,
    deadline: Duration,
    mut on_retry: R,
    mut op: F,
) -> Result<(T, u32), RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
    R: FnMut(u32, &AttemptError),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match tokio::time::timeout(deadline, op(attempt)).await {
            Ok(Ok(value)) => return Ok((value, attempt)),
            Ok(Err(e)) => AttemptError::Failed(e.to_string()),
            Err(_) => AttemptError::TimedOut(deadline),
        };
        if attempt >= max_attempts {
            return Err(RetryExhausted {
                attempts: attempt,
                last: error,
            });
        }
        on_retry(attempt, &error);
        tokio::time::sleep(policy.backoff(attempt)).await;
        attempt += 1;
    }
}
