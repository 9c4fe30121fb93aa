use serde::{Deserialize, Serialize};

/// Body posted to the email and SMS gateways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "UPPERCASE")]
pub enum GatewayPayload {
    #[serde(rename_all = "camelCase")]
    Email {
        to: String,
        from: String,
        from_name: String,
        subject: String,
        body: String,

        #[serde(skip_serializing_if = "Option::is_none")]
        redirect_url: Option<String>,

        #[serde(skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Sms {
        to: String,
        from: String,
        from_name: String,
        body: String,
    },
}
