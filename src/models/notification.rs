use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::Push => "PUSH",
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(Channel::Email),
            "SMS" => Ok(Channel::Sms),
            "PUSH" => Ok(Channel::Push),
            other => Err(format!("unsupported notification type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequesterType {
    User,
    Admin,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    #[serde(rename = "type")]
    pub requester_type: RequesterType,
    pub id: String,
}

/// One entry of a direct recipient list. Each field feeds exactly one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectRecipient {
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub device_token: Option<String>,
}

impl DirectRecipient {
    /// The contact address this entry supplies for `channel`, ignoring blanks.
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        let field = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone_number.as_deref(),
            Channel::Push => self.device_token.as_deref(),
        };

        field.map(str::trim).filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecipientSpec {
    UserIds(Vec<String>),
    DirectRecipients(Vec<DirectRecipient>),
    Segment(String),
    AllUsers,
}

impl RecipientSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            RecipientSpec::UserIds(_) => "userIds",
            RecipientSpec::DirectRecipients(_) => "directRecipients",
            RecipientSpec::Segment(_) => "segment",
            RecipientSpec::AllUsers => "allUsers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "UPPERCASE")]
pub enum SenderIdentity {
    Email {
        sender_email_address: String,
        sender_name: String,
    },
    Sms {
        sender_phone_number: String,
        sender_name: String,
    },
    Push {
        sender_name: String,
    },
}

impl SenderIdentity {
    pub fn channel(&self) -> Channel {
        match self {
            SenderIdentity::Email { .. } => Channel::Email,
            SenderIdentity::Sms { .. } => Channel::Sms,
            SenderIdentity::Push { .. } => Channel::Push,
        }
    }

    pub fn sender_name(&self) -> &str {
        match self {
            SenderIdentity::Email { sender_name, .. }
            | SenderIdentity::Sms { sender_name, .. }
            | SenderIdentity::Push { sender_name } => sender_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateContent {
    pub template_id: String,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectContent {
    pub title: String,
    pub body: String,
    pub redirect_url: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Template(TemplateContent),
    Direct(DirectContent),
}

/// A request that passed validation. Never mutated after acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub requester: Requester,
    pub recipients: RecipientSpec,
    pub channels: BTreeSet<Channel>,
    pub senders: BTreeMap<Channel, SenderIdentity>,
    pub content: MessageContent,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub memo: Option<String>,
}
