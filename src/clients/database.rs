use std::sync::Arc;

use anyhow::{Context, Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row, types::Json};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    models::{
        delivery::{DeliveryRecord, DeliveryStatus},
        message::DispatchJob,
        recipient::{RecipientOrigin, ResolvedRecipient},
    },
    ports::{DeliveryLog, ScheduledJobStore},
};

const MIGRATION: &str = r#"
    CREATE TABLE IF NOT EXISTS scheduled_jobs (
        job_id UUID PRIMARY KEY,
        idempotency_key TEXT NOT NULL,
        fire_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE INDEX IF NOT EXISTS scheduled_jobs_fire_at_idx ON scheduled_jobs (fire_at);

    CREATE TABLE IF NOT EXISTS notification_messages (
        message_id UUID PRIMARY KEY,
        job_id UUID NOT NULL,
        channel TEXT NOT NULL,
        address TEXT NOT NULL,
        user_id TEXT,
        language TEXT,
        status TEXT NOT NULL,
        failure_reason TEXT,
        retryable BOOLEAN NOT NULL DEFAULT false,
        created_at TIMESTAMPTZ NOT NULL,
        dispatched_at TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS notification_messages_job_idx ON notification_messages (job_id);
"#;

/// Scheduled jobs in PostgreSQL. Claiming deletes rows under `SKIP LOCKED`,
/// so concurrent schedulers never fire the same job twice.
pub struct PgScheduledJobStore {
    client: Arc<Client>,
}

impl PgScheduledJobStore {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        info!("PostgreSQL connection established");

        let store = Self {
            client: Arc::new(client),
        };
        store.migrate().await?;

        Ok(store)
    }

    async fn migrate(&self) -> Result<(), Error> {
        self.client
            .batch_execute(MIGRATION)
            .await
            .context("Failed to create dispatch tables")?;

        debug!("scheduled_jobs and notification_messages tables ready");
        Ok(())
    }

    /// Delivery log on the same connection.
    pub fn delivery_log(&self) -> PgDeliveryLog {
        PgDeliveryLog {
            client: Arc::clone(&self.client),
        }
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}

#[async_trait]
impl ScheduledJobStore for PgScheduledJobStore {
    async fn schedule(&self, job: &DispatchJob, fire_at: DateTime<Utc>) -> Result<()> {
        self.client
            .execute(
                r#"
                INSERT INTO scheduled_jobs (job_id, idempotency_key, fire_at, payload)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (job_id)
                DO UPDATE SET fire_at = EXCLUDED.fire_at, payload = EXCLUDED.payload
                "#,
                &[&job.job_id, &job.idempotency_key, &fire_at, &Json(job)],
            )
            .await
            .map_err(|e| {
                error!(error = %e, job_id = %job.job_id, "Failed to persist scheduled job");
                anyhow!("Failed to persist scheduled job: {}", e)
            })?;

        Ok(())
    }

    async fn next_fire_time(&self) -> Result<Option<DateTime<Utc>>> {
        let row = self
            .client
            .query_one("SELECT MIN(fire_at) FROM scheduled_jobs", &[])
            .await
            .context("Failed to read next fire time")?;

        Ok(row.try_get(0)?)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>> {
        let rows = self
            .client
            .query(
                r#"
                DELETE FROM scheduled_jobs
                WHERE job_id IN (
                    SELECT job_id FROM scheduled_jobs
                    WHERE fire_at <= $1
                    ORDER BY fire_at
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING fire_at, payload
                "#,
                &[&now, &(limit as i64)],
            )
            .await
            .context("Failed to claim due jobs")?;

        let mut claimed = rows
            .iter()
            .map(|row| -> Result<(DateTime<Utc>, DispatchJob), Error> {
                let fire_at: DateTime<Utc> = row.try_get("fire_at")?;
                let Json(job): Json<DispatchJob> = row.try_get("payload")?;
                Ok((fire_at, job))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        claimed.sort_by_key(|(fire_at, _)| *fire_at);

        if !claimed.is_empty() {
            debug!(claimed = claimed.len(), "Claimed due jobs");
        }

        Ok(claimed.into_iter().map(|(_, job)| job).collect())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<Option<DispatchJob>> {
        let row = self
            .client
            .query_opt(
                "DELETE FROM scheduled_jobs WHERE job_id = $1 RETURNING payload",
                &[&job_id],
            )
            .await
            .context("Failed to cancel scheduled job")?;

        row.map(|row| -> Result<DispatchJob, Error> {
            let Json(job): Json<DispatchJob> = row.try_get("payload")?;
            Ok(job)
        })
        .transpose()
    }

    async fn pending_count(&self) -> Result<usize> {
        let row = self
            .client
            .query_one("SELECT COUNT(*) FROM scheduled_jobs", &[])
            .await
            .context("Failed to count scheduled jobs")?;

        let count: i64 = row.try_get(0)?;
        Ok(count as usize)
    }
}

/// Per-recipient delivery status rows in `notification_messages`.
pub struct PgDeliveryLog {
    client: Arc<Client>,
}

fn delivery_from_row(row: &Row) -> Result<DeliveryRecord, Error> {
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    let user_id: Option<String> = row.try_get("user_id")?;
    let language: Option<String> = row.try_get("language")?;

    let origin = match user_id {
        Some(user_id) => RecipientOrigin::User(user_id),
        None => RecipientOrigin::Direct,
    };

    Ok(DeliveryRecord {
        message_id: row.try_get("message_id")?,
        job_id: row.try_get("job_id")?,
        channel: channel.parse().map_err(Error::msg)?,
        recipient: ResolvedRecipient {
            address: row.try_get("address")?,
            origin,
            language,
        },
        status: status.parse::<DeliveryStatus>().map_err(Error::msg)?,
        created_at: row.try_get("created_at")?,
        dispatched_at: row.try_get("dispatched_at")?,
        failure_reason: row.try_get("failure_reason")?,
        retryable: row.try_get("retryable")?,
    })
}

#[async_trait]
impl DeliveryLog for PgDeliveryLog {
    async fn record(&self, record: &DeliveryRecord) -> Result<()> {
        self.client
            .execute(
                r#"
                INSERT INTO notification_messages (
                    message_id, job_id, channel, address, user_id, language,
                    status, failure_reason, retryable, created_at, dispatched_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (message_id)
                DO UPDATE SET
                    status = EXCLUDED.status,
                    failure_reason = EXCLUDED.failure_reason,
                    retryable = EXCLUDED.retryable,
                    dispatched_at = EXCLUDED.dispatched_at
                "#,
                &[
                    &record.message_id,
                    &record.job_id,
                    &record.channel.as_str(),
                    &record.recipient.address,
                    &record.recipient.user_id(),
                    &record.recipient.language,
                    &record.status.as_str(),
                    &record.failure_reason,
                    &record.retryable,
                    &record.created_at,
                    &record.dispatched_at,
                ],
            )
            .await
            .with_context(|| format!("Failed to record delivery {}", record.message_id))?;

        Ok(())
    }

    async fn for_job(&self, job_id: Uuid) -> Result<Vec<DeliveryRecord>> {
        let rows = self
            .client
            .query(
                r#"
                SELECT message_id, job_id, channel, address, user_id, language,
                       status, failure_reason, retryable, created_at, dispatched_at
                FROM notification_messages
                WHERE job_id = $1
                ORDER BY created_at, message_id
                "#,
                &[&job_id],
            )
            .await
            .context("Failed to load delivery records")?;

        rows.iter().map(delivery_from_row).collect()
    }
}
