use std::time::Duration;

use anyhow::{Error, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::{config::Config, models::retry::RetryConfig};

impl RetryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            initial_delay_ms: config.initial_retry_delay_ms,
            max_delay_ms: config.max_retry_delay_ms,
            backoff_multiplier: config.retry_backoff_multiplier,
        }
    }
}

pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(config, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up immediately on errors
/// `is_transient` rejects.
pub async fn retry_when<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation: F,
    is_transient: P,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        attempt,
                        max_attempts = config.max_attempts,
                        "Retry succeeded"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !is_transient(&e) {
                    debug!(attempt, error = %e, "Permanent error, not retrying");
                    return Err(e);
                }

                if attempt >= config.max_attempts {
                    warn!(
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                debug!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms,
                    "Retry attempt failed, backing off"
                );

                let jitter = rand::random_range(-0.1..=0.1);

                let jittered_delay = (delay_ms as f64 * (1.0 + jitter)) as u64;

                sleep(Duration::from_millis(jittered_delay)).await;

                delay_ms = std::cmp::min(
                    delay_ms.saturating_mul(config.backoff_multiplier),
                    config.max_delay_ms,
                );
            }
        }
    }
}

/// Runs an external lookup under a deadline, folding the elapsed case into the
/// operation's own error type.
pub async fn bounded<T, Fut>(limit: Duration, what: &str, operation: Fut) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    match timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(TimedOut).context(format!(
            "{} timed out after {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

/// Marker attached to errors produced by [`bounded`] when the deadline passed.
#[derive(Debug, Clone, Copy)]
pub struct TimedOut;

impl std::fmt::Display for TimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("timed out")
    }
}

impl std::error::Error for TimedOut {}

pub fn is_timeout(err: &Error) -> bool {
    err.downcast_ref::<TimedOut>().is_some()
}

/// SHA-256 over the canonical JSON form of `body`. Object keys are sorted by
/// `serde_json::Value`, so field order on the wire does not matter.
pub fn fingerprint<T: Serialize>(body: &T) -> Result<String, Error> {
    let canonical = serde_json::to_value(body)?;
    let bytes = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&bytes);

    Ok(digest.iter().map(|byte| format!("{:02x}", byte)).collect())
}
