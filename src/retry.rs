//! Backoff for transient cluster errors

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cluster::ClusterError;

/// First delay between attempts
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Delay ceiling
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Attempts made before a transient error is surfaced
pub const MAX_ATTEMPTS: usize = 5;

/// Retry policy for cluster round trips
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: usize,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: INITIAL_BACKOFF,
            max: MAX_BACKOFF,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl Backoff {
    /// Run `f` until it succeeds, fails with a non-transient error, or
    /// the attempts run out
    ///
    /// Starts with `initial` backoff, doubling each time up to `max`.
    /// A policy with `max_attempts == 0` still makes one attempt.
    pub async fn retry<F, Fut, T>(&self, mut f: F) -> Result<T, ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = self.initial;
        let mut attempt = 1;

        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Retry exhausted all attempts"
                    );
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        attempt,
                        max_attempts,
                        backoff = ?backoff,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.max);
                    attempt += 1;
                }
            }
        }
    }
}
