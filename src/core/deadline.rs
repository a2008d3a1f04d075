//! Deadline-Wrapped Requests
//!
//! Rendezvous calls carry no timeout of their own, so every call that leaves
//! the process is raced against a fixed deadline. Exactly one side of the
//! race decides the outcome:
//!
//! - the call resolves first: its `Ok` or `Err` is returned as-is
//! - the deadline elapses first: the call is dropped (cancelled at the
//!   future level) and [`DeadlineError::Elapsed`] is returned
//!
//! A result that would have arrived after the deadline is never observed.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Outcome of a request that did not succeed in time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeadlineError<E> {
    /// The deadline elapsed before the call resolved.
    #[error("{operation} timed out after {after:?}")]
    Elapsed {
        /// Name of the abandoned operation.
        operation: &'static str,
        /// Configured timeout.
        after: Duration,
    },

    /// The call resolved first, with an error.
    #[error("{0}")]
    Failed(E),
}

/// An in-flight request and the instant at which it is abandoned.
pub struct PendingRequest<F> {
    operation: &'static str,
    timeout: Duration,
    deadline: Instant,
    future: F,
}

impl<F, T, E> PendingRequest<F>
where
    F: Future<Output = Result<T, E>>,
{
    /// Start the deadline clock for `future`.
    pub fn new(operation: &'static str, timeout: Duration, future: F) -> Self {
        Self {
            operation,
            timeout,
            deadline: Instant::now() + timeout,
            future,
        }
    }

    /// Name of the wrapped operation.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Instant at which the request is abandoned.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Drive the request until it resolves or the deadline elapses.
    pub async fn resolve(self) -> Result<T, DeadlineError<E>> {
        match tokio::time::timeout_at(self.deadline, self.future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DeadlineError::Failed(e)),
            Err(_) => Err(DeadlineError::Elapsed {
                operation: self.operation,
                after: self.timeout,
            }),
        }
    }
}

/// Race `future` against `timeout`.
pub async fn with_deadline<F, T, E>(
    operation: &'static str,
    timeout: Duration,
    future: F,
) -> Result<T, DeadlineError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    PendingRequest::new(operation, timeout, future).resolve().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fast_success() {
        let result: Result<u32, DeadlineError<String>> =
            with_deadline("op", Duration::from_secs(10), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_failure_is_not_a_timeout() {
        let result: Result<u32, DeadlineError<String>> = with_deadline(
            "op",
            Duration::from_secs(10),
            async { Err("service said no".to_string()) },
        )
        .await;
        assert_eq!(result, Err(DeadlineError::Failed("service said no".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let result: Result<u32, DeadlineError<String>> =
            with_deadline("allocate", Duration::from_secs(10), async {
                tokio::time::sleep(Duration::from_secs(11)).await;
                Ok(1)
            })
            .await;

        assert_eq!(
            result,
            Err(DeadlineError::Elapsed {
                operation: "allocate",
                after: Duration::from_secs(10),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fixed_at_creation() {
        let pending = PendingRequest::new("op", Duration::from_secs(5), async {
            Ok::<_, String>(())
        });
        let expected = Instant::now() + Duration::from_secs(5);
        assert_eq!(pending.deadline(), expected);
        assert_eq!(pending.operation(), "op");
    }

    #[test]
    fn test_elapsed_message() {
        let err: DeadlineError<String> = DeadlineError::Elapsed {
            operation: "get_code",
            after: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "get_code timed out after 10s");
    }
}
