use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tracing::{debug, info};

use crate::{config::Config, models::message::DeadLetter, ports::DeadLetterSink};

/// Publishes failed deliveries to a durable RabbitMQ queue.
pub struct RabbitMqDeadLetterSink {
    connection: Connection,
    channel: Channel,
    failed_queue_name: String,
}

impl RabbitMqDeadLetterSink {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .queue_declare(
                &config.failed_queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare failed queue: {}", e))?;

        info!(queue = %config.failed_queue_name, "Dead letter queue declared");

        Ok(Self {
            connection,
            channel,
            failed_queue_name: config.failed_queue_name.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

#[async_trait]
impl DeadLetterSink for RabbitMqDeadLetterSink {
    async fn publish(&self, letter: &DeadLetter) -> Result<()> {
        let payload = serde_json::to_vec(letter)?;

        self.channel
            .basic_publish(
                "",
                &self.failed_queue_name,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish dead letter: {}", e))?
            .await
            .map_err(|e| anyhow!("Dead letter was not confirmed: {}", e))?;

        debug!(
            job_id = %letter.job_id,
            channel = %letter.channel,
            "Dead letter published"
        );

        Ok(())
    }
}
