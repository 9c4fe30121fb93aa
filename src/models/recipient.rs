use serde::{Deserialize, Serialize};

use crate::models::notification::Channel;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RecipientOrigin {
    User(String),
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRecipient {
    pub address: String,
    pub origin: RecipientOrigin,

    /// Preferred language from the directory. Direct entries have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl ResolvedRecipient {
    pub fn user(user_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            origin: RecipientOrigin::User(user_id.into()),
            language: None,
        }
    }

    pub fn direct(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            origin: RecipientOrigin::Direct,
            language: None,
        }
    }

    pub fn with_language(mut self, language: Option<&str>) -> Self {
        self.language = language
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .map(str::to_string);
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.origin {
            RecipientOrigin::User(user_id) => Some(user_id),
            RecipientOrigin::Direct => None,
        }
    }
}

/// Who receives a channel's message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "recipients", rename_all = "snake_case")]
pub enum Audience {
    Listed(Vec<ResolvedRecipient>),
    /// Whole user base, streamed from the directory page by page at dispatch time.
    Broadcast,
}

impl Audience {
    pub fn listed_len(&self) -> Option<usize> {
        match self {
            Audience::Listed(recipients) => Some(recipients.len()),
            Audience::Broadcast => None,
        }
    }
}

/// Contact addresses the directory holds for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContacts {
    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub phone_number: Option<String>,

    #[serde(default)]
    pub device_token: Option<String>,

    #[serde(default)]
    pub language: Option<String>,
}

impl UserContacts {
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
#[serde(rename_all = "camelCase")]
pub struct BroadcastContact {
    pub user_id: String,
    pub address: String,

    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPage {
    pub contacts: Vec<BroadcastContact>,

    #[serde(default)]
    pub next_cursor: Option<String>,
}
