use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use anyhow::Error;
use futures_util::future::try_join_all;
use tracing::{debug, warn};

use crate::{
    error::{DispatchError, DispatchResult},
    models::{
        message::{ContentLimits, FinalMessage},
        notification::{Channel, DirectContent, MessageContent, TemplateContent},
        template::{TemplateDefinition, TemplateRenderKey},
    },
    ports::TemplateStore,
    utils::{bounded, is_timeout},
};

struct CachedDefinition {
    definition: Option<TemplateDefinition>,
    fetched_at: Instant,
}

/// Builds the channel-native message for every requested channel.
///
/// Template definitions are cached per (template, channel, language) for
/// `cache_ttl`, absent translations included. A zero TTL disables the cache.
pub struct ContentAssembler {
    templates: Arc<dyn TemplateStore>,
    limits: ContentLimits,
    lookup_timeout: Duration,
    cache_ttl: Duration,
    cache: Mutex<HashMap<TemplateRenderKey, CachedDefinition>>,
}

impl ContentAssembler {
    pub fn new(
        templates: Arc<dyn TemplateStore>,
        limits: ContentLimits,
        lookup_timeout: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            templates,
            limits,
            lookup_timeout,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn assemble_all(
        &self,
        content: &MessageContent,
        channels: &BTreeSet<Channel>,
    ) -> DispatchResult<BTreeMap<Channel, FinalMessage>> {
        let messages = try_join_all(channels.iter().map(|&channel| async move {
            self.assemble(content, channel)
                .await
                .map(|message| (channel, message))
        }))
        .await?;

        Ok(messages.into_iter().collect())
    }

    pub async fn assemble(
        &self,
        content: &MessageContent,
        channel: Channel,
    ) -> DispatchResult<FinalMessage> {
        let message = match content {
            MessageContent::Direct(direct) => from_direct(direct, channel),
            MessageContent::Template(template) => self.from_template(template, channel).await?,
        };

        self.check_size(message, channel)
    }

    /// Renders the `language` translation of a template.
    ///
    /// `Ok(None)` means the template has no such translation and the default
    /// message applies.
    pub async fn localize(
        &self,
        template: &TemplateContent,
        channel: Channel,
        language: &str,
    ) -> DispatchResult<Option<FinalMessage>> {
        let key = TemplateRenderKey::new(&template.template_id, channel, Some(language));

        let Some(definition) = self.definition(&key).await.map_err(lookup_error)? else {
            debug!(render_key = %key, "No translation, default message applies");
            return Ok(None);
        };

        let message = render_definition(&definition, channel, &template.parameters)?;
        self.check_size(message, channel).map(Some)
    }

    fn check_size(&self, message: FinalMessage, channel: Channel) -> DispatchResult<FinalMessage> {
        let size = message.payload_len();
        let limit = self.limits.limit_for(channel);
        if size > limit {
            return Err(DispatchError::ContentTooLarge {
                channel,
                size,
                limit,
            });
        }

        Ok(message)
    }

    async fn from_template(
        &self,
        template: &TemplateContent,
        channel: Channel,
    ) -> DispatchResult<FinalMessage> {
        let key = TemplateRenderKey::new(&template.template_id, channel, None);

        let definition = self
            .definition(&key)
            .await
            .map_err(lookup_error)?
            .ok_or_else(|| {
                template_error(format!(
                    "unknown template '{}' for {}",
                    template.template_id, channel
                ))
            })?;

        debug!(
            template_id = %template.template_id,
            channel = %channel,
            parameter_count = template.parameters.len(),
            "Rendering template"
        );

        render_definition(&definition, channel, &template.parameters)
    }

    async fn definition(&self, key: &TemplateRenderKey) -> Result<Option<TemplateDefinition>, Error> {
        if let Some(cached) = self.cached(key) {
            return Ok(cached);
        }

        let fetched = bounded(
            self.lookup_timeout,
            "template lookup",
            self.templates
                .get_template(&key.template_id, key.channel, key.language.as_deref()),
        )
        .await?;

        if !self.cache_ttl.is_zero() {
            lock(&self.cache).insert(
                key.clone(),
                CachedDefinition {
                    definition: fetched.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }

        Ok(fetched)
    }

    fn cached(&self, key: &TemplateRenderKey) -> Option<Option<TemplateDefinition>> {
        let mut cache = lock(&self.cache);

        match cache.get(key) {
            Some(entry) if entry.fetched_at.elapsed() < self.cache_ttl => {
                Some(entry.definition.clone())
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lookup_error(err: Error) -> DispatchError {
    DispatchError::TemplateRender {
        reason: format!("{:#}", err),
        retryable: is_timeout(&err),
    }
}

fn render_definition(
    definition: &TemplateDefinition,
    channel: Channel,
    parameters: &BTreeMap<String, String>,
) -> DispatchResult<FinalMessage> {
    let slot = |name: &str, value: &Option<String>| -> DispatchResult<String> {
        let text = value.as_deref().ok_or_else(|| {
            template_error(format!(
                "template '{}' has no {} slot for {}",
                definition.template_id, name, channel
            ))
        })?;

        render(text, parameters).map_err(|missing| {
            warn!(
                template_id = %definition.template_id,
                missing_variable = %missing,
                "Template contains unreplaced variable"
            );
            template_error(format!(
                "missing parameter '{}' for template '{}'",
                missing, definition.template_id
            ))
        })
    };

    match channel {
        Channel::Email => Ok(FinalMessage::Email {
            subject: slot("subject", &definition.subject)?,
            body: slot("body", &definition.body)?,
            redirect_url: None,
            image_url: None,
        }),
        Channel::Sms => Ok(FinalMessage::Sms {
            body: slot("body", &definition.body)?,
        }),
        Channel::Push => Ok(FinalMessage::Push {
            title: slot("title", &definition.title)?,
            body: slot("body", &definition.body)?,
            redirect_url: None,
            image_url: None,
        }),
    }
}

fn from_direct(content: &DirectContent, channel: Channel) -> FinalMessage {
    match channel {
        Channel::Email => FinalMessage::Email {
            subject: content.title.clone(),
            body: content.body.clone(),
            redirect_url: content.redirect_url.clone(),
            image_url: content.image_url.clone(),
        },
        Channel::Sms => {
            let title = content.title.trim();
            let body = if title.is_empty() {
                content.body.clone()
            } else {
                format!("{}\n{}", title, content.body)
            };
            FinalMessage::Sms { body }
        }
        Channel::Push => FinalMessage::Push {
            title: content.title.clone(),
            body: content.body.clone(),
            redirect_url: content.redirect_url.clone(),
            image_url: content.image_url.clone(),
        },
    }
}

fn template_error(reason: String) -> DispatchError {
    DispatchError::TemplateRender {
        reason,
        retryable: false,
    }
}

/// Substitutes `{{name}}` placeholders in a single pass.
///
/// Substituted values are not scanned again. An unterminated `{{` is kept
/// verbatim. Returns the first placeholder name with no parameter as the error.
pub fn render(template: &str, parameters: &BTreeMap<String, String>) -> Result<String, String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };

        output.push_str(&rest[..start]);

        let name = after_open[..end].trim();
        match parameters.get(name) {
            Some(value) => output.push_str(value),
            None => return Err(name.to_string()),
        }

        rest = &after_open[end + 2..];
    }

    output.push_str(rest);
    Ok(output)
}
