//! Bounded retry with exponential backoff for single upload requests.

use crate::{errors::TransportError, services::connectivity::Connectivity};
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// How often and how patiently a request is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (0-based): `base * 2^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug)]
pub enum RetryError {
    Cancelled,
    Exhausted {
        attempts: u32,
        last: TransportError,
    },
}

/// Run `op` until it succeeds, `policy.max_attempts` is reached, or `cancel`
/// fires.
///
/// Before every attempt the token is checked and, if the network is down,
/// the call parks until `connectivity` reports online again. `op` receives
/// the 0-based attempt number.
pub async fn run_with_retry<T, F, Fut, C>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    connectivity: &C,
    label: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
    C: Connectivity,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        if !connectivity.is_online() {
            info!(label, "offline, waiting for the network before sending");
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = connectivity.wait_online() => {}
            }
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let attempts = attempt + 1;
                if attempts >= max_attempts {
                    warn!(label, attempts, error = %err, "giving up");
                    return Err(RetryError::Exhausted {
                        attempts,
                        last: err,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    label,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "request failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt = attempts;
            }
        }
    }
}
