use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{notification::Channel, recipient::ResolvedRecipient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Accepted,
    Scheduled,
    Dispatching,
    Completed,
    Failed,
    Cancelled,
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            JobState::Accepted => write!(f, "accepted"),
            JobState::Scheduled => write!(f, "scheduled"),
            JobState::Dispatching => write!(f, "dispatching"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a channel collaborator reports for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    TerminalFailure(String),
    /// The collaborator gave up on a transient failure.
    Retryable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDelivery {
    pub recipient: ResolvedRecipient,
    pub reason: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Delivered,
    PartiallyDelivered,
    Failed,
    NoRecipients,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelReport {
    pub status: ChannelStatus,
    pub delivered: u64,
    pub failed: Vec<FailedDelivery>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelReport {
    pub fn from_counts(delivered: u64, failed: Vec<FailedDelivery>) -> Self {
        let status = match (delivered, failed.len()) {
            (0, 0) => ChannelStatus::NoRecipients,
            (_, 0) => ChannelStatus::Delivered,
            (0, _) => ChannelStatus::Failed,
            _ => ChannelStatus::PartiallyDelivered,
        };

        Self {
            status,
            delivered,
            failed,
            error: None,
        }
    }

    /// The channel could not run at all, e.g. the broadcast stream broke.
    pub fn aborted(delivered: u64, failed: Vec<FailedDelivery>, error: String) -> Self {
        let status = if delivered > 0 {
            ChannelStatus::PartiallyDelivered
        } else {
            ChannelStatus::Failed
        };

        Self {
            status,
            delivered,
            failed,
            error: Some(error),
        }
    }
}

/// Final per-channel picture of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: Uuid,
    pub state: JobState,
    pub channels: BTreeMap<Channel, ChannelReport>,
    pub completed_at: DateTime<Utc>,
}

impl JobReport {
    pub fn is_fully_delivered(&self) -> bool {
        self.channels
            .values()
            .all(|report| report.status == ChannelStatus::Delivered)
    }
}

/// Response recorded against an idempotency key and replayed to duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SubmitOutcome {
    #[serde(rename_all = "camelCase")]
    Accepted { job_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Scheduled { job_id: Uuid, fire_at: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    Rejected { code: String, reason: String },
}

impl SubmitOutcome {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            SubmitOutcome::Accepted { job_id } | SubmitOutcome::Scheduled { job_id, .. } => {
                Some(*job_id)
            }
            SubmitOutcome::Rejected { .. } => None,
        }
    }
}

/// What a status lookup by idempotency key returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub idempotency_key: String,
    pub state: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SubmitOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<JobReport>,
}

impl JobStatusView {
    pub fn new(
        idempotency_key: String,
        outcome: Option<SubmitOutcome>,
        report: Option<JobReport>,
    ) -> Self {
        let state = match (&outcome, &report) {
            (_, Some(report)) => report.state,
            (None, None) => JobState::Accepted,
            (Some(SubmitOutcome::Rejected { .. }), None) => JobState::Failed,
            (Some(SubmitOutcome::Scheduled { .. }), None) => JobState::Scheduled,
            (Some(SubmitOutcome::Accepted { .. }), None) => JobState::Dispatching,
        };

        Self {
            idempotency_key,
            state,
            outcome,
            report,
        }
    }
}
