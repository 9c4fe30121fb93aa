//! Seams between the dispatch core and everything it does not own: storage,
//! the user directory, the template store and the channel providers.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    delivery::DeliveryRecord,
    idempotency::{IdempotencyRecord, InsertResult},
    message::{DeadLetter, DispatchJob, FinalMessage},
    notification::{Channel, SenderIdentity},
    recipient::{ContactPage, ResolvedRecipient, UserContacts},
    status::DeliveryOutcome,
    template::TemplateDefinition,
};

/// Shared idempotency state. Every method must be atomic on its own key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert `record` only if the key is absent; otherwise return what is stored.
    async fn try_insert(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<InsertResult>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Overwrite the record and restart its expiry.
    async fn put(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<()>;

    /// Overwrite an existing record keeping its expiry. Returns false if the key is gone.
    async fn update(&self, record: &IdempotencyRecord) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Drop expired records. Stores with native expiry return 0.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Durable wait structure for jobs with a future fire time.
#[async_trait]
pub trait ScheduledJobStore: Send + Sync {
    async fn schedule(&self, job: &DispatchJob, fire_at: DateTime<Utc>) -> Result<()>;

    async fn next_fire_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// Remove and return up to `limit` jobs due at `now`, earliest first.
    /// A job is handed to exactly one caller.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>>;

    /// Remove a pending job and return it. `None` if it already fired or never existed.
    async fn cancel(&self, job_id: Uuid) -> Result<Option<DispatchJob>>;

    async fn pending_count(&self) -> Result<usize>;
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Contacts for the given users. Unknown users are simply absent from the map.
    async fn lookup_contacts(
        &self,
        user_ids: &[String],
        channels: &BTreeSet<Channel>,
    ) -> Result<HashMap<String, UserContacts>>;

    /// Members of a named segment, or `None` if no such segment exists.
    async fn resolve_segment(&self, name: &str) -> Result<Option<Vec<String>>>;

    async fn list_all_users(
        &self,
        channel: Channel,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ContactPage>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// `language: None` asks for the default translation. A language the
    /// template has no translation for returns `None`.
    async fn get_template(
        &self,
        template_id: &str,
        channel: Channel,
        language: Option<&str>,
    ) -> Result<Option<TemplateDefinition>>;
}

/// Provider integration for one channel. Owns its own retry policy.
#[async_trait]
pub trait ChannelDeliverer: Send + Sync {
    fn channel(&self) -> Channel;

    async fn deliver(
        &self,
        message: &FinalMessage,
        recipient: &ResolvedRecipient,
        sender: &SenderIdentity,
    ) -> DeliveryOutcome;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: &DeadLetter) -> Result<()>;
}

/// Per-recipient delivery status of every dispatched job.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// Insert the record, or overwrite the one with the same message id.
    async fn record(&self, record: &DeliveryRecord) -> Result<()>;

    /// Records of one job in creation order.
    async fn for_job(&self, job_id: Uuid) -> Result<Vec<DeliveryRecord>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
