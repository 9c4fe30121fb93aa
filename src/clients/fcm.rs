use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        gateway::guarded_send,
        http::{HttpFailure, build_client},
    },
    config::Config,
    models::{
        fcm::{FcmMessage, FcmNotification, FcmRequest},
        message::FinalMessage,
        notification::{Channel, SenderIdentity},
        recipient::ResolvedRecipient,
        retry::RetryConfig,
        status::DeliveryOutcome,
        validation::validate_device_token,
    },
    ports::ChannelDeliverer,
};

const FCM_SCOPES: &[&str] = &["https://www.googleapis.com/auth/firebase.messaging"];

/// PUSH delivery through the FCM HTTP v1 API.
pub struct FcmPushDeliverer {
    http_client: Client,
    fcm_project_id: String,
    token_provider: Arc<dyn TokenProvider>,
    retry_config: RetryConfig,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl FcmPushDeliverer {
    pub async fn new(config: &Config, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, Error> {
        let token_provider = gcp_auth::provider().await?;

        info!(project_id = %config.fcm_project_id, "FCM client initialized");

        Ok(Self {
            http_client: build_client(Duration::from_secs(10))?,
            fcm_project_id: config.fcm_project_id.clone(),
            token_provider,
            retry_config: config.retry_config(),
            circuit_breaker,
        })
    }

    fn request(
        message: &FinalMessage,
        recipient: &ResolvedRecipient,
        sender: &SenderIdentity,
    ) -> Option<FcmRequest> {
        let FinalMessage::Push {
            title,
            body,
            redirect_url,
            image_url,
        } = message
        else {
            return None;
        };

        let mut data = HashMap::from([("sender_name".to_string(), sender.sender_name().to_string())]);
        if let Some(url) = redirect_url {
            data.insert("redirect_url".to_string(), url.clone());
        }

        Some(FcmRequest {
            message: FcmMessage {
                token: recipient.address.clone(),
                notification: FcmNotification {
                    title: title.clone(),
                    body: body.clone(),
                    image: image_url.clone(),
                },
                data: Some(data),
            },
        })
    }

    async fn send_once(&self, request: &FcmRequest) -> Result<(), HttpFailure> {
        let token = self
            .token_provider
            .token(FCM_SCOPES)
            .await
            .map_err(|e| HttpFailure::Transient(format!("FCM auth failed: {}", e)))?;

        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.fcm_project_id
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token.as_str())
            .json(request)
            .send()
            .await
            .map_err(HttpFailure::from_reqwest)?;

        if response.status().is_success() {
            info!("FCM push notification sent successfully");
            Ok(())
        } else {
            Err(HttpFailure::from_response(response).await)
        }
    }
}

#[async_trait]
impl ChannelDeliverer for FcmPushDeliverer {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn deliver(
        &self,
        message: &FinalMessage,
        recipient: &ResolvedRecipient,
        sender: &SenderIdentity,
    ) -> DeliveryOutcome {
        if let Err(e) = validate_device_token(&recipient.address) {
            warn!(error = %e, "Invalid device token format, not sending");
            return DeliveryOutcome::TerminalFailure(e.to_string());
        }

        let Some(request) = Self::request(message, recipient, sender) else {
            return DeliveryOutcome::TerminalFailure(format!(
                "FCM cannot send a {} message",
                message.channel()
            ));
        };

        debug!(recipient = %recipient.address, "Sending FCM push notification");

        guarded_send(&self.circuit_breaker, &self.retry_config, || {
            self.send_once(&request)
        })
        .await
    }
}
