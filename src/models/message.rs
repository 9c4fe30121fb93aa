use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    notification::{Channel, Requester, SenderIdentity, TemplateContent},
    recipient::{Audience, ResolvedRecipient},
};

/// Channel-native message, ready to hand to a delivery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "UPPERCASE")]
pub enum FinalMessage {
    #[serde(rename_all = "camelCase")]
    Email {
        subject: String,
        body: String,
        redirect_url: Option<String>,
        image_url: Option<String>,
    },
    Sms {
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    Push {
        title: String,
        body: String,
        redirect_url: Option<String>,
        image_url: Option<String>,
    },
}

impl FinalMessage {
    pub fn channel(&self) -> Channel {
        match self {
            FinalMessage::Email { .. } => Channel::Email,
            FinalMessage::Sms { .. } => Channel::Sms,
            FinalMessage::Push { .. } => Channel::Push,
        }
    }

    /// Bytes counted against the channel's size limit.
    pub fn payload_len(&self) -> usize {
        match self {
            FinalMessage::Email { subject, body, .. } => subject.len() + body.len(),
            FinalMessage::Sms { body } => body.len(),
            FinalMessage::Push { title, body, .. } => title.len() + body.len(),
        }
    }
}

/// Fully validated, resolved and assembled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub job_id: Uuid,
    pub idempotency_key: String,
    pub requester: Requester,
    pub memo: Option<String>,
    pub audiences: BTreeMap<Channel, Audience>,
    /// Default-language message per channel.
    pub messages: BTreeMap<Channel, FinalMessage>,
    /// Source template, kept to render recipients' own languages at dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateContent>,
    pub senders: BTreeMap<Channel, SenderIdentity>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub accepted_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.messages.keys().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub idempotency_key: String,
    pub channel: Channel,
    pub recipient: ResolvedRecipient,
    pub failure_reason: String,
    pub retryable: bool,
    pub failed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentLimits {
    pub max_email_bytes: usize,
    pub max_sms_bytes: usize,
    pub max_push_bytes: usize,
}

impl ContentLimits {
    pub fn limit_for(&self, channel: Channel) -> usize {
        match channel {
            Channel::Email => self.max_email_bytes,
            Channel::Sms => self.max_sms_bytes,
            Channel::Push => self.max_push_bytes,
        }
    }
}

impl Default for ContentLimits {
    fn default() -> Self {
        Self {
            max_email_bytes: 256 * 1024,
            max_sms_bytes: 2000,
            max_push_bytes: 4096,
        }
    }
}
