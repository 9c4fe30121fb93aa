use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::{debug, info};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        http::{HttpFailure, build_client},
    },
    models::{
        gateway::GatewayPayload,
        message::FinalMessage,
        notification::{Channel, SenderIdentity},
        recipient::ResolvedRecipient,
        retry::RetryConfig,
        status::DeliveryOutcome,
    },
    ports::ChannelDeliverer,
    utils::retry_when,
};

/// Turns the outcome of a breaker-guarded, retried send into a delivery outcome.
///
/// Permanent failures never count against the breaker. Transient failures that
/// outlive the retries, and calls the open breaker refuses, come back as `Retryable`.
pub async fn guarded_send<F, Fut>(
    circuit_breaker: &CircuitBreaker,
    retry_config: &RetryConfig,
    send_once: F,
) -> DeliveryOutcome
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), HttpFailure>>,
{
    let attempt = circuit_breaker
        .call(|| async {
            match retry_when(retry_config, &send_once, HttpFailure::is_transient).await {
                Ok(()) => Ok(DeliveryOutcome::Success),
                Err(HttpFailure::Permanent(reason)) => Ok(DeliveryOutcome::TerminalFailure(reason)),
                Err(HttpFailure::Transient(reason)) => Err(anyhow!(reason)),
            }
        })
        .await;

    attempt.unwrap_or_else(|e| DeliveryOutcome::Retryable(e.to_string()))
}

/// Email or SMS provider reached through a JSON gateway endpoint.
pub struct HttpChannelGateway {
    channel: Channel,
    http_client: Client,
    endpoint: Url,
    retry_config: RetryConfig,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl HttpChannelGateway {
    pub fn new(
        channel: Channel,
        endpoint: &str,
        retry_config: RetryConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, Error> {
        if channel == Channel::Push {
            return Err(anyhow!("PUSH is delivered through FCM, not a gateway"));
        }

        let endpoint = Url::parse(endpoint)
            .map_err(|e| anyhow!("Invalid {} gateway URL '{}': {}", channel, endpoint, e))?;

        info!(channel = %channel, endpoint = %endpoint, "Channel gateway initialized");

        Ok(Self {
            channel,
            http_client: build_client(Duration::from_secs(10))?,
            endpoint,
            retry_config,
            circuit_breaker,
        })
    }

    fn payload(
        &self,
        message: &FinalMessage,
        recipient: &ResolvedRecipient,
        sender: &SenderIdentity,
    ) -> Option<GatewayPayload> {
        match (message, sender) {
            (
                FinalMessage::Email {
                    subject,
                    body,
                    redirect_url,
                    image_url,
                },
                SenderIdentity::Email {
                    sender_email_address,
                    sender_name,
                },
            ) => Some(GatewayPayload::Email {
                to: recipient.address.clone(),
                from: sender_email_address.clone(),
                from_name: sender_name.clone(),
                subject: subject.clone(),
                body: body.clone(),
                redirect_url: redirect_url.clone(),
                image_url: image_url.clone(),
            }),
            (
                FinalMessage::Sms { body },
                SenderIdentity::Sms {
                    sender_phone_number,
                    sender_name,
                },
            ) => Some(GatewayPayload::Sms {
                to: recipient.address.clone(),
                from: sender_phone_number.clone(),
                from_name: sender_name.clone(),
                body: body.clone(),
            }),
            _ => None,
        }
    }

    async fn send_once(&self, payload: &GatewayPayload) -> Result<(), HttpFailure> {
        let response = self
            .http_client
            .post(self.endpoint.clone())
            .json(payload)
            .send()
            .await
            .map_err(HttpFailure::from_reqwest)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(HttpFailure::from_response(response).await)
        }
    }
}

#[async_trait]
impl ChannelDeliverer for HttpChannelGateway {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(
        &self,
        message: &FinalMessage,
        recipient: &ResolvedRecipient,
        sender: &SenderIdentity,
    ) -> DeliveryOutcome {
        let Some(payload) = self.payload(message, recipient, sender) else {
            return DeliveryOutcome::TerminalFailure(format!(
                "{} gateway cannot send a {} message",
                self.channel,
                message.channel()
            ));
        };

        debug!(channel = %self.channel, recipient = %recipient.address, "Sending through gateway");

        guarded_send(&self.circuit_breaker, &self.retry_config, || {
            self.send_once(&payload)
        })
        .await
    }
}
