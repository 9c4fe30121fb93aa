use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, info};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        http::{HttpFailure, build_client, endpoint},
    },
    config::Config,
    models::{notification::Channel, retry::RetryConfig, template::TemplateDefinition},
    ports::TemplateStore,
    utils::retry_when,
};

/// Template definitions from the template service:
/// `GET {base}/api/v1/templates/{templateId}?channel={CHANNEL}[&language={lang}]`.
pub struct HttpTemplateStore {
    http_client: Client,
    base_url: String,
    retry_config: RetryConfig,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl HttpTemplateStore {
    pub fn new(config: &Config, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, Error> {
        info!(base_url = %config.template_service_url, "Template service client initialized");

        Ok(Self {
            http_client: build_client(Duration::from_secs(10))?,
            base_url: config.template_service_url.clone(),
            retry_config: config.retry_config(),
            circuit_breaker,
        })
    }

    async fn fetch_once(&self, url: &Url) -> Result<Option<TemplateDefinition>, HttpFailure> {
        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(HttpFailure::from_reqwest)?;

        match response.status() {
            status if status.is_success() => response
                .json::<TemplateDefinition>()
                .await
                .map(Some)
                .map_err(HttpFailure::from_reqwest),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(HttpFailure::from_response(response).await),
        }
    }
}

#[async_trait]
impl TemplateStore for HttpTemplateStore {
    async fn get_template(
        &self,
        template_id: &str,
        channel: Channel,
        language: Option<&str>,
    ) -> Result<Option<TemplateDefinition>> {
        let mut url = endpoint(&self.base_url, &["api", "v1", "templates", template_id])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("channel", channel.as_str());
            if let Some(language) = language {
                query.append_pair("language", language);
            }
        }

        debug!(template_id, channel = %channel, language = ?language, "Fetching template from service");

        let definition = self
            .circuit_breaker
            .call(|| async {
                retry_when(
                    &self.retry_config,
                    || self.fetch_once(&url),
                    HttpFailure::is_transient,
                )
                .await
                .map_err(|e| anyhow!("Template service request failed: {}", e))
            })
            .await?;

        if let Some(found) = &definition
            && found.channel != channel
        {
            return Err(anyhow!(
                "Template service returned {} definition for a {} lookup",
                found.channel,
                channel
            ));
        }

        Ok(definition)
    }
}
