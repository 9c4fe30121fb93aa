use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{notification::Channel, recipient::ResolvedRecipient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Pending,
    Dispatched,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Dispatched => "DISPATCHED",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "DISPATCHED" => Ok(DeliveryStatus::Dispatched),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("delivery cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
}

/// One message to one recipient on one channel, tracked from creation to its
/// final provider answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub channel: Channel,
    pub recipient: ResolvedRecipient,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default)]
    pub retryable: bool,
}

impl DeliveryRecord {
    pub fn pending(
        job_id: Uuid,
        channel: Channel,
        recipient: ResolvedRecipient,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            job_id,
            channel,
            recipient,
            status: DeliveryStatus::Pending,
            created_at: now,
            dispatched_at: None,
            failure_reason: None,
            retryable: false,
        }
    }

    /// The provider accepted the message.
    pub fn mark_dispatched(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != DeliveryStatus::Pending {
            return Err(InvalidTransition {
                from: self.status,
                to: DeliveryStatus::Dispatched,
            });
        }

        self.status = DeliveryStatus::Dispatched;
        self.dispatched_at = Some(at);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        retryable: bool,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if self.status == DeliveryStatus::Failed {
            return Err(InvalidTransition {
                from: self.status,
                to: DeliveryStatus::Failed,
            });
        }

        self.status = DeliveryStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.retryable = retryable;
        self.dispatched_at = Some(at);
        Ok(())
    }
}
