//! In-process adapters for single-node deployments and tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    models::{
        delivery::DeliveryRecord,
        idempotency::{IdempotencyRecord, InsertResult},
        message::DispatchJob,
    },
    ports::{Clock, DeliveryLog, IdempotencyStore, ScheduledJobStore},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *lock(&self.now) += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *lock(&self.now) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

struct Entry {
    record: IdempotencyRecord,
    expires_at: DateTime<Utc>,
}

pub struct MemoryIdempotencyStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryIdempotencyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now();
        lock(&self.entries)
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn try_insert(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<InsertResult> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = lock(&self.entries);

        if let Some(entry) = entries.get(&record.key)
            && entry.expires_at > now
        {
            return Ok(InsertResult::Existing(entry.record.clone()));
        }

        entries.insert(
            record.key.clone(),
            Entry {
                record: record.clone(),
                expires_at,
            },
        );

        Ok(InsertResult::Inserted)
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let now = self.clock.now();

        Ok(lock(&self.entries)
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.record.clone()))
    }

    async fn put(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl);

        lock(&self.entries).insert(
            record.key.clone(),
            Entry {
                record: record.clone(),
                expires_at,
            },
        );

        Ok(())
    }

    async fn update(&self, record: &IdempotencyRecord) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = lock(&self.entries);

        match entries.get_mut(&record.key) {
            Some(entry) if entry.expires_at > now => {
                entry.record = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}

#[derive(Default)]
struct Schedule {
    by_time: BTreeMap<(DateTime<Utc>, Uuid), DispatchJob>,
    fire_times: HashMap<Uuid, DateTime<Utc>>,
}

impl Schedule {
    fn remove(&mut self, job_id: Uuid) -> Option<DispatchJob> {
        let fire_at = self.fire_times.remove(&job_id)?;
        self.by_time.remove(&(fire_at, job_id))
    }
}

/// Scheduled jobs ordered by fire time, then job id.
#[derive(Default)]
pub struct MemoryScheduledJobStore {
    schedule: Mutex<Schedule>,
}

impl MemoryScheduledJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduledJobStore for MemoryScheduledJobStore {
    async fn schedule(&self, job: &DispatchJob, fire_at: DateTime<Utc>) -> Result<()> {
        let mut schedule = lock(&self.schedule);
        schedule.remove(job.job_id);
        schedule.fire_times.insert(job.job_id, fire_at);
        schedule.by_time.insert((fire_at, job.job_id), job.clone());
        Ok(())
    }

    async fn next_fire_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(lock(&self.schedule)
            .by_time
            .keys()
            .next()
            .map(|(fire_at, _)| *fire_at))
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>> {
        let mut schedule = lock(&self.schedule);

        let due: Vec<Uuid> = schedule
            .by_time
            .keys()
            .take_while(|(fire_at, _)| *fire_at <= now)
            .take(limit)
            .map(|(_, job_id)| *job_id)
            .collect();

        Ok(due
            .into_iter()
            .filter_map(|job_id| schedule.remove(job_id))
            .collect())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<Option<DispatchJob>> {
        Ok(lock(&self.schedule).remove(job_id))
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(lock(&self.schedule).by_time.len())
    }
}

#[derive(Default)]
struct DeliveryRecords {
    ordered: Vec<DeliveryRecord>,
    positions: HashMap<Uuid, usize>,
}

/// Delivery records in insertion order.
#[derive(Default)]
pub struct MemoryDeliveryLog {
    records: Mutex<DeliveryRecords>,
}

impl MemoryDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryLog for MemoryDeliveryLog {
    async fn record(&self, record: &DeliveryRecord) -> Result<()> {
        let mut records = lock(&self.records);

        match records.positions.get(&record.message_id).copied() {
            Some(position) => records.ordered[position] = record.clone(),
            None => {
                let position = records.ordered.len();
                records.positions.insert(record.message_id, position);
                records.ordered.push(record.clone());
            }
        }

        Ok(())
    }

    async fn for_job(&self, job_id: Uuid) -> Result<Vec<DeliveryRecord>> {
        Ok(lock(&self.records)
            .ordered
            .iter()
            .filter(|record| record.job_id == job_id)
            .cloned()
            .collect())
    }
}
