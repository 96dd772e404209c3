use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Error, Result};

/// Bounded retry with a fixed delay between attempts.
///
/// Callers keep the loop (so the operation may borrow a session mutably)
/// and hand each failure to `next_attempt`:
///
/// ```ignore
/// let mut attempt = 1;
/// let result = loop {
///     match session.order_send(&request).await.and_then(OrderResult::into_result) {
///         Ok(done) => break Ok(done),
///         Err(e) => {
///             if let Err(e) = policy.next_attempt(&shutdown, "modify", attempt, e).await {
///                 break Err(e);
///             }
///         }
///     }
///     attempt += 1;
/// };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Decide what happens after attempt number `attempt` failed with `error`.
    ///
    /// Returns `Ok(())` after sleeping `delay` if another attempt is allowed.
    /// Returns the error itself if it is not retryable or attempts are
    /// exhausted, and `Error::Cancelled` if shutdown interrupts the sleep.
    pub async fn next_attempt(
        &self,
        shutdown: &CancellationToken,
        label: &str,
        attempt: u32,
        error: Error,
    ) -> Result<()> {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return Err(error);
        }
        warn!(
            op = label,
            attempt,
            max_attempts = self.max_attempts,
            error = %error,
            "Attempt failed, retrying"
        );
        if sleep_or_cancel(shutdown, self.delay).await {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Sleep for `duration` unless shutdown is requested first.
/// Returns `false` if the sleep was cut short.
pub async fn sleep_or_cancel(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
