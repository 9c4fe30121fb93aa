use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use anyhow::{Error, Result, anyhow};
use tracing::{debug, info, warn};

use crate::models::circuit_breaker::{CircuitBreakerConfig, CircuitState};

/// Per-process breaker in front of one collaborator.
///
/// Opens after `failure_threshold` consecutive failures, lets a probe through
/// after `timeout_seconds`, and closes again after `success_threshold` probes succeed.
pub struct CircuitBreaker {
    service_name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(service_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service_name = service_name.into();
        info!(service = %service_name, "Circuit breaker initialized");

        Self {
            service_name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.before_call()?;

        match operation().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn before_call(&self) -> Result<(), Error> {
        let mut inner = self.lock();

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let cool_down = Duration::from_secs(self.config.timeout_seconds);
        let ready = inner
            .opened_at
            .is_some_and(|opened_at| opened_at.elapsed() >= cool_down);

        if ready {
            info!(service = %self.service_name, "Circuit breaker attempting reset");
            inner.state = CircuitState::HalfOpen;
            inner.successes = 0;
            return Ok(());
        }

        warn!(service = %self.service_name, "Circuit breaker is open, rejecting request");
        Err(anyhow!("Circuit breaker is open for {}", self.service_name))
    }

    fn record_success(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                debug!(
                    service = %self.service_name,
                    successes = inner.successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker success recorded"
                );

                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    info!(service = %self.service_name, "Circuit breaker closed after successful recovery");
                }
            }
            _ => inner.failures = 0,
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(service = %self.service_name, "Circuit breaker reopened after failed recovery attempt");
            return;
        }

        inner.failures += 1;
        debug!(
            service = %self.service_name,
            failures = inner.failures,
            threshold = self.config.failure_threshold,
            "Circuit breaker failure recorded"
        );

        if inner.failures >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                service = %self.service_name,
                failures = inner.failures,
                "Circuit breaker opened due to consecutive failures"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(timeout_seconds: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "sms_gateway",
            CircuitBreakerConfig {
                failure_threshold: 2,
                timeout_seconds,
                success_threshold: 1,
            },
        )
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = breaker(60);

        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>(anyhow!("boom")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = breaker.call(|| async { Ok::<_, Error>(1) }).await;
        assert!(rejected.unwrap_err().to_string().contains("open"));
    }

    #[tokio::test]
    async fn closes_after_successful_probe() {
        let breaker = breaker(0);

        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>(anyhow!("boom")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let value = breaker.call(|| async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
