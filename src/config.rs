use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    models::{
        circuit_breaker::CircuitBreakerConfig, idempotency::GuardConfig, message::ContentLimits,
        retry::RetryConfig,
    },
    pipeline::{dispatcher::DispatcherConfig, scheduler::SchedulerConfig},
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub redis_url: String,
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,
    #[serde(default = "default_in_flight_ttl_seconds")]
    pub idempotency_in_flight_ttl_seconds: u64,
    #[serde(default = "default_admission_wait_ms")]
    pub idempotency_wait_timeout_ms: u64,
    #[serde(default = "default_admission_poll_ms")]
    pub idempotency_poll_interval_ms: u64,

    pub database_url: String,

    pub rabbitmq_url: String,
    #[serde(default = "default_failed_queue_name")]
    pub failed_queue_name: String,

    pub template_service_url: String,
    pub directory_service_url: String,
    pub email_gateway_url: String,
    pub sms_gateway_url: String,
    pub fcm_project_id: String,

    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    #[serde(default = "default_broadcast_page_size")]
    pub broadcast_page_size: usize,
    #[serde(default = "default_broadcast_dedup_capacity")]
    pub broadcast_dedup_capacity: usize,
    #[serde(default = "default_template_cache_ttl_seconds")]
    pub template_cache_ttl_seconds: u64,

    #[serde(default = "default_max_email_bytes")]
    pub max_email_bytes: usize,
    #[serde(default = "default_max_sms_bytes")]
    pub max_sms_bytes: usize,
    #[serde(default = "default_max_push_bytes")]
    pub max_push_bytes: usize,

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_timeout_seconds: u64,
    pub circuit_breaker_success_threshold: u32,

    pub max_retry_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_backoff_multiplier: u64,

    pub worker_concurrency: usize,
    #[serde(default = "default_delivery_concurrency")]
    pub delivery_concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub job_queue_capacity: usize,

    #[serde(default = "default_scheduler_poll_ms")]
    pub scheduler_poll_interval_ms: u64,
    #[serde(default = "default_scheduler_batch_size")]
    pub scheduler_batch_size: usize,

    pub server_port: u16,
}

fn default_idempotency_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_in_flight_ttl_seconds() -> u64 {
    60
}

fn default_admission_wait_ms() -> u64 {
    10_000
}

fn default_admission_poll_ms() -> u64 {
    100
}

fn default_failed_queue_name() -> String {
    "notifications.failed".to_string()
}

fn default_lookup_timeout_ms() -> u64 {
    5_000
}

fn default_broadcast_page_size() -> usize {
    500
}

fn default_broadcast_dedup_capacity() -> usize {
    1_000_000
}

fn default_template_cache_ttl_seconds() -> u64 {
    300
}

fn default_max_email_bytes() -> usize {
    ContentLimits::default().max_email_bytes
}

fn default_max_sms_bytes() -> usize {
    ContentLimits::default().max_sms_bytes
}

fn default_max_push_bytes() -> usize {
    ContentLimits::default().max_push_bytes
}

fn default_delivery_concurrency() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_scheduler_poll_ms() -> u64 {
    1_000
}

fn default_scheduler_batch_size() -> usize {
    100
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;

        if config.worker_concurrency == 0 {
            return Err(anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }

        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from_config(self)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            timeout_seconds: self.circuit_breaker_timeout_seconds,
            success_threshold: self.circuit_breaker_success_threshold,
        }
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            retention: Duration::from_secs(self.idempotency_ttl_seconds),
            in_flight_lease: Duration::from_secs(self.idempotency_in_flight_ttl_seconds),
            wait_timeout: Duration::from_millis(self.idempotency_wait_timeout_ms),
            poll_interval: Duration::from_millis(self.idempotency_poll_interval_ms),
        }
    }

    pub fn content_limits(&self) -> ContentLimits {
        ContentLimits {
            max_email_bytes: self.max_email_bytes,
            max_sms_bytes: self.max_sms_bytes,
            max_push_bytes: self.max_push_bytes,
        }
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn template_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.template_cache_ttl_seconds)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            delivery_concurrency: self.delivery_concurrency.max(1),
            broadcast_page_size: self.broadcast_page_size.max(1),
            broadcast_dedup_capacity: self.broadcast_dedup_capacity,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.scheduler_poll_interval_ms),
            batch_size: self.scheduler_batch_size.max(1),
        }
    }
}
