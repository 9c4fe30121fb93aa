//! Wire shapes of the creation endpoint.
//!
//! Fields stay optional and stringly typed so the request validator, not the
//! JSON decoder, reports which rule a body breaks first.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::notification::{DirectRecipient, Requester};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientsBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_recipients: Option<Vec<DirectRecipient>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_users: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfoBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_email_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_phone_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateBody {
    pub template_id: String,

    #[serde(default)]
    pub template_parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBody {
    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub body: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationCreateRequest {
    pub requester: Requester,

    #[serde(default)]
    pub recipients: RecipientsBody,

    #[serde(default)]
    pub notification_types: Vec<String>,

    #[serde(default)]
    pub sender_infos: BTreeMap<String, SenderInfoBody>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateBody>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentBody>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl NotificationCreateRequest {
    /// Copy used for fingerprinting. Channel names are upper-cased, sorted and
    /// deduplicated, since their order carries no meaning.
    pub fn normalized(&self) -> Self {
        let mut normalized = self.clone();

        let mut types: Vec<String> = self
            .notification_types
            .iter()
            .map(|name| name.trim().to_ascii_uppercase())
            .collect();
        types.sort();
        types.dedup();
        normalized.notification_types = types;

        normalized
    }
}
