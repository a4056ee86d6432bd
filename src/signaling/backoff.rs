//! Exponential backoff for rendezvous reconnection.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SignalingConfig;
use crate::signaling::SignalingError;

/// Retry schedule: `base * multiplier^(n-1)` after the n-th consecutive
/// failure, capped at `max_delay`, giving up after `max_attempts` failures.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_config(config: &SignalingConfig) -> Self {
        Self {
            base: config.base_delay(),
            max_delay: config.max_delay(),
            multiplier: config.backoff_multiplier,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay to wait after `failures` consecutive failures (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Runs `attempt` until it succeeds, sleeping per `backoff` between
/// failures. Fails with [`SignalingError::Unavailable`] on the
/// `max_attempts`-th consecutive failure, without sleeping again.
pub async fn retry<T, E, F, Fut>(backoff: &Backoff, mut attempt: F) -> Result<T, SignalingError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut failures = 0;
    loop {
        match attempt(failures + 1).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                failures += 1;
                if failures >= backoff.max_attempts {
                    warn!(attempts = failures, %error, "rendezvous unreachable, giving up");
                    return Err(SignalingError::Unavailable { attempts: failures });
                }
                let delay = backoff.delay(failures);
                debug!(attempt = failures, ?delay, %error, "rendezvous connection failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
