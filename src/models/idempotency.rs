use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::status::{JobReport, SubmitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    InFlight,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: String,
    pub state: RecordState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SubmitOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<JobReport>,

    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn in_flight(key: &str, fingerprint: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            state: RecordState::InFlight,
            outcome: None,
            report: None,
            created_at: now,
        }
    }
}

/// Result of the store's atomic check-and-insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    Existing(IdempotencyRecord),
}

/// Proof that the caller won admission for a key and must complete or abandon it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionTicket {
    pub key: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Proceed(AdmissionTicket),
    Replay(SubmitOutcome),
    Conflict,
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// How long a completed key stays reserved. After that it can be reused.
    pub retention: Duration,
    /// Lifetime of an in-flight reservation whose owner never completes it.
    pub in_flight_lease: Duration,
    /// How long a duplicate waits for the first caller before giving up.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            in_flight_lease: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}
