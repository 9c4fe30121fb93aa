use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

use crate::models::notification::Channel;

/// Slot definitions a template store returns for one (template, channel, language).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDefinition {
    pub template_id: String,
    pub channel: Channel,

    #[serde(default)]
    pub subject: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub body: Option<String>,

    /// Language the store resolved to. `None` for the default translation.
    #[serde(default)]
    pub language: Option<String>,
}

/// Identity of one template translation. `None` asks for the store's default.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateRenderKey {
    pub template_id: String,
    pub channel: Channel,
    pub language: Option<String>,
}

impl TemplateRenderKey {
    pub fn new(template_id: &str, channel: Channel, language: Option<&str>) -> Self {
        Self {
            template_id: template_id.to_string(),
            channel,
            language: language.map(str::to_string),
        }
    }
}

impl Display for TemplateRenderKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "{}_{}_{}",
            self.template_id,
            self.channel,
            self.language.as_deref().unwrap_or("default")
        )
    }
}
