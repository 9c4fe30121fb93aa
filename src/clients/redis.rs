use std::time::Duration;

use anyhow::{Context, Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::{debug, info};

use crate::{
    config::Config,
    models::{
        idempotency::{IdempotencyRecord, InsertResult},
        retry::RetryConfig,
    },
    ports::IdempotencyStore,
    utils::retry_with_backoff,
};

/// Idempotency records as JSON strings under `idempotency:{key}` with native expiry.
pub struct RedisIdempotencyStore {
    connection: MultiplexedConnection,
    retry_config: RetryConfig,
}

impl RedisIdempotencyStore {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            retry_config: config.retry_config(),
        })
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        conn.ping::<String>().await?;
        Ok(())
    }

    fn key(idempotency_key: &str) -> String {
        format!("idempotency:{}", idempotency_key)
    }

    fn encode(record: &IdempotencyRecord) -> Result<String, Error> {
        serde_json::to_string(record).context("Failed to serialize idempotency record")
    }

    fn decode(raw: &str) -> Result<IdempotencyRecord, Error> {
        serde_json::from_str(raw).context("Corrupt idempotency record")
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn try_insert(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<InsertResult> {
        let key = Self::key(&record.key);
        let payload = Self::encode(record)?;

        loop {
            let mut conn = self.connection.clone();

            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&payload)
                .arg("NX")
                .arg("EX")
                .arg(ttl_seconds(ttl))
                .query_async(&mut conn)
                .await
                .context("Failed to reserve idempotency key")?;

            if reply.is_some() {
                debug!(idempotency_key = %record.key, "Idempotency key stored");
                return Ok(InsertResult::Inserted);
            }

            let existing: Option<String> = conn
                .get(&key)
                .await
                .context("Failed to read idempotency key")?;

            // The holder expired between SET NX and GET, so try again.
            if let Some(raw) = existing {
                return Ok(InsertResult::Existing(Self::decode(&raw)?));
            }
        }
    }

    async fn get(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.connection.clone();

        let raw: Option<String> = conn
            .get(Self::key(idempotency_key))
            .await
            .context("Failed to read idempotency key")?;

        raw.as_deref().map(Self::decode).transpose()
    }

    async fn put(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<()> {
        let key = Self::key(&record.key);
        let payload = Self::encode(record)?;

        retry_with_backoff(&self.retry_config, || {
            let mut conn = self.connection.clone();
            let key = key.clone();
            let payload = payload.clone();

            async move {
                conn.set_ex::<_, _, ()>(&key, &payload, ttl_seconds(ttl))
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to store idempotency record: {}", e))
    }

    async fn update(&self, record: &IdempotencyRecord) -> Result<bool> {
        let mut conn = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(&record.key))
            .arg(Self::encode(record)?)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .context("Failed to update idempotency record")?;

        Ok(reply.is_some())
    }

    async fn remove(&self, idempotency_key: &str) -> Result<()> {
        let mut conn = self.connection.clone();

        conn.del::<_, ()>(Self::key(idempotency_key))
            .await
            .context("Failed to delete idempotency key")?;

        Ok(())
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}
