//! Connection retry.
//!
//! Only connection establishment goes through here. Operational calls (trigger, move)
//! surface their first error.

use crate::config::ConnectionSettings;
use crate::error::{AppResult, DaqError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Delay schedule between connection attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `initial`, then multiplied by `factor` after every failure.
    Exponential {
        /// Delay after the first failure
        initial: Duration,
        /// Growth factor
        factor: u32,
    },
}

impl Backoff {
    /// Delay after the failure of attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { initial, factor } => {
                let scale = factor.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(scale)
            }
        }
    }
}

/// Defines a policy for retrying a device connection.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::Fixed(Duration::from_millis(500)),
        }
    }
}

impl RetryPolicy {
    /// Policy from the `[connection]` section.
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        let delay = Duration::from_millis(settings.backoff_ms);
        let backoff = if settings.exponential {
            Backoff::Exponential {
                initial: delay,
                factor: 2,
            }
        } else {
            Backoff::Fixed(delay)
        };
        Self {
            max_attempts: settings.n_tries.max(1),
            backoff,
        }
    }
}

/// Run `connect` until it succeeds or the policy is exhausted.
///
/// Returns `ConnectionExhausted` carrying the last failure once every attempt failed.
pub async fn connect_with_retry<T, F, Fut>(
    device: &str,
    policy: &RetryPolicy,
    mut connect: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut last_error = String::from("no attempt made");
    for attempt in 1..=policy.max_attempts {
        match connect().await {
            Ok(device_handle) => {
                debug!(device, attempt, "Device connected");
                return Ok(device_handle);
            }
            Err(err) => {
                warn!(
                    device,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "Device connection failed"
                );
                last_error = err.to_string();
                if attempt < policy.max_attempts {
                    sleep(policy.backoff.delay(attempt)).await;
                }
            }
        }
    }
    Err(DaqError::ConnectionExhausted {
        device: device.to_string(),
        attempts: policy.max_attempts,
        last_error,
    })
}
