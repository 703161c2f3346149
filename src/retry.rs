//! Fixed-backoff retry for transient failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{StorageError, TransportError};

/// Backoff sequence between consecutive attempts
pub const DEFAULT_BACKOFF: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(5)];

/// Classifies an error as transient.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

impl Retriable for TransportError {
    fn is_retriable(&self) -> bool {
        TransportError::is_retriable(self)
    }
}

impl Retriable for StorageError {
    fn is_retriable(&self) -> bool {
        StorageError::is_retriable(self)
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Runs an operation, sleeping through the backoff sequence after each
/// retriable failure. One retry per backoff entry; non-retriable errors
/// return immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { backoff: DEFAULT_BACKOFF.to_vec() }
    }
}

impl RetryPolicy {
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self { backoff }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self { backoff: Vec::new() }
    }

    pub fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }

    /// Run `operation` until it succeeds, fails permanently, or the backoff
    /// sequence is exhausted. The closure receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retriable + Display,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(target: "relay::retry", operation = operation_name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if error.is_retriable() && attempt <= self.backoff.len() => {
                    let delay = self.backoff[attempt - 1];
                    warn!(
                        target: "relay::retry",
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retriable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fmt;
    use tokio::time::Instant;

    #[derive(Debug)]
    struct Flaky {
        retriable: bool,
    }

    impl Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flaky(retriable={})", self.retriable)
        }
    }

    impl Retriable for Flaky {
        fn is_retriable(&self) -> bool {
            self.retriable
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_after_1s_and_3s() {
        let start = Instant::now();
        let stamps = Mutex::new(Vec::new());

        let result = RetryPolicy::default()
            .run("flaky", |attempt| {
                stamps.lock().push(start.elapsed());
                async move {
                    if attempt < 3 {
                        Err(Flaky { retriable: true })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            *stamps.lock(),
            vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(4)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retriable_aborts_immediately() {
        let calls = Mutex::new(0);
        let result: Result<(), Flaky> = RetryPolicy::default()
            .run("fatal", |_| {
                *calls.lock() += 1;
                async { Err(Flaky { retriable: false }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_four_attempts() {
        let start = Instant::now();
        let calls = Mutex::new(0);
        let result: Result<(), Flaky> = RetryPolicy::default()
            .run("down", |_| {
                *calls.lock() += 1;
                async { Err(Flaky { retriable: true }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts(), 4);
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }
}
