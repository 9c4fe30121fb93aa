use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::circuit_breaker::CircuitState;

/// Ordered from best to worst so the overall status is the maximum of its checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyHealth {
    pub status: HealthStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<CircuitState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DependencyHealth {
    pub fn reachable(response_time_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time_ms: Some(response_time_ms),
            circuit_state: None,
            error: None,
        }
    }

    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: None,
            circuit_state: None,
            error: Some(error.into()),
        }
    }

    /// A collaborator behind a breaker. Anything but a closed breaker degrades the service.
    pub fn from_circuit(state: CircuitState) -> Self {
        let (status, error) = match state {
            CircuitState::Closed => (HealthStatus::Healthy, None),
            CircuitState::HalfOpen => (
                HealthStatus::Degraded,
                Some("circuit breaker probing for recovery".to_string()),
            ),
            CircuitState::Open => (
                HealthStatus::Degraded,
                Some("circuit breaker open, calls are refused".to_string()),
            ),
        };

        Self {
            status,
            response_time_ms: None,
            circuit_state: Some(state),
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: HashMap<String, DependencyHealth>,
}

impl HealthCheckResponse {
    pub fn new(checks: HashMap<String, DependencyHealth>, timestamp: DateTime<Utc>) -> Self {
        let status = checks
            .values()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            timestamp,
            checks,
        }
    }
}
