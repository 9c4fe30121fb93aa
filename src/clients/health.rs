use std::{collections::HashMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker, database::PgScheduledJobStore,
        rbmq::RabbitMqDeadLetterSink, redis::RedisIdempotencyStore,
    },
    models::health::{DependencyHealth, HealthCheckResponse},
};

/// A dependency whose reachability is part of the service's health.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl HealthProbe for RedisIdempotencyStore {
    fn name(&self) -> &str {
        "idempotency_store"
    }

    async fn check(&self) -> anyhow::Result<()> {
        self.ping().await
    }
}

#[async_trait]
impl HealthProbe for PgScheduledJobStore {
    fn name(&self) -> &str {
        "scheduled_job_store"
    }

    async fn check(&self) -> anyhow::Result<()> {
        self.health_check().await
    }
}

#[async_trait]
impl HealthProbe for RabbitMqDeadLetterSink {
    fn name(&self) -> &str {
        "dead_letter_queue"
    }

    async fn check(&self) -> anyhow::Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("RabbitMQ connection is closed"))
        }
    }
}

/// Probes are critical: any failure makes the service unhealthy. A breaker
/// that is not closed only degrades it.
pub struct HealthChecker {
    probes: Vec<Arc<dyn HealthProbe>>,
    breakers: Vec<Arc<CircuitBreaker>>,
}

impl HealthChecker {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>, breakers: Vec<Arc<CircuitBreaker>>) -> Self {
        Self { probes, breakers }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let probed = join_all(self.probes.iter().map(|probe| async move {
            (probe.name().to_string(), Self::check_probe(probe.as_ref()).await)
        }))
        .await;

        let mut checks: HashMap<String, DependencyHealth> = probed.into_iter().collect();

        for breaker in &self.breakers {
            let state = breaker.state();
            debug!(
                service = breaker.service_name(),
                circuit_state = state.as_str(),
                "Circuit breaker state checked"
            );
            checks.insert(
                breaker.service_name().to_string(),
                DependencyHealth::from_circuit(state),
            );
        }

        HealthCheckResponse::new(checks, Utc::now())
    }

    async fn check_probe(probe: &dyn HealthProbe) -> DependencyHealth {
        let start = Instant::now();

        match probe.check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(dependency = probe.name(), response_time_ms = elapsed, "Health check passed");
                DependencyHealth::reachable(elapsed)
            }
            Err(e) => {
                warn!(dependency = probe.name(), error = %e, "Health check failed");
                DependencyHealth::unreachable(e.to_string())
            }
        }
    }
}
