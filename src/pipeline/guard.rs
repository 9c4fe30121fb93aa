use std::sync::Arc;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::{
    error::{DispatchError, DispatchResult},
    models::{
        idempotency::{
            Admission, AdmissionTicket, GuardConfig, IdempotencyRecord, InsertResult, RecordState,
        },
        status::{JobReport, SubmitOutcome},
    },
    ports::{Clock, IdempotencyStore},
};

/// Admits each idempotency key once per retention window.
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    config: GuardConfig,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, clock: Arc<dyn Clock>, config: GuardConfig) -> Self {
        info!(
            retention_secs = config.retention.as_secs(),
            in_flight_lease_secs = config.in_flight_lease.as_secs(),
            "Idempotency guard initialized"
        );

        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Reserves `key` for the caller, replays a finished result, or reports a
    /// conflict. Duplicates of a request still in flight wait for it.
    pub async fn admit(&self, key: Option<&str>, fingerprint: &str) -> DispatchResult<Admission> {
        let key = key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(DispatchError::MissingIdempotencyKey)?;

        let deadline = Instant::now() + self.config.wait_timeout;

        loop {
            let candidate = IdempotencyRecord::in_flight(key, fingerprint, self.clock.now());

            let inserted = self
                .store
                .try_insert(&candidate, self.config.in_flight_lease)
                .await
                .map_err(DispatchError::store)?;

            let existing = match inserted {
                InsertResult::Inserted => {
                    debug!(idempotency_key = %key, "Idempotency key reserved");
                    return Ok(Admission::Proceed(AdmissionTicket {
                        key: key.to_string(),
                        fingerprint: fingerprint.to_string(),
                    }));
                }
                InsertResult::Existing(existing) => existing,
            };

            if existing.fingerprint != fingerprint {
                warn!(idempotency_key = %key, "Idempotency key reused with a different request");
                return Ok(Admission::Conflict);
            }

            if existing.state == RecordState::Completed
                && let Some(outcome) = existing.outcome
            {
                info!(idempotency_key = %key, "Replaying recorded outcome");
                return Ok(Admission::Replay(outcome));
            }

            if Instant::now() >= deadline {
                warn!(idempotency_key = %key, "Gave up waiting for in-flight request");
                return Err(DispatchError::RequestInFlight);
            }

            debug!(idempotency_key = %key, "Request in flight elsewhere, waiting");
            sleep(self.config.poll_interval).await;
        }
    }

    /// Stores the outcome for the retention window. Duplicates replay it from now on.
    pub async fn complete(
        &self,
        ticket: &AdmissionTicket,
        outcome: &SubmitOutcome,
    ) -> DispatchResult<()> {
        let record = IdempotencyRecord {
            key: ticket.key.clone(),
            fingerprint: ticket.fingerprint.clone(),
            state: RecordState::Completed,
            outcome: Some(outcome.clone()),
            report: None,
            created_at: self.clock.now(),
        };

        self.store
            .put(&record, self.config.retention)
            .await
            .map_err(DispatchError::store)?;

        debug!(idempotency_key = %ticket.key, "Idempotency outcome recorded");
        Ok(())
    }

    /// Releases the reservation so the caller can retry with the same key.
    pub async fn abandon(&self, ticket: &AdmissionTicket) -> DispatchResult<()> {
        let current = self
            .store
            .get(&ticket.key)
            .await
            .map_err(DispatchError::store)?;

        let ours = current.is_some_and(|record| record.fingerprint == ticket.fingerprint);

        if ours {
            self.store
                .remove(&ticket.key)
                .await
                .map_err(DispatchError::store)?;
            debug!(idempotency_key = %ticket.key, "Idempotency reservation released");
        }

        Ok(())
    }

    /// Attaches the dispatch report to a completed key without touching its outcome.
    pub async fn record_report(&self, key: &str, report: &JobReport) -> DispatchResult<bool> {
        let Some(mut record) = self.store.get(key).await.map_err(DispatchError::store)? else {
            warn!(idempotency_key = %key, "Idempotency record expired before job report");
            return Ok(false);
        };

        record.report = Some(report.clone());

        self.store
            .update(&record)
            .await
            .map_err(DispatchError::store)
    }

    pub async fn lookup(&self, key: &str) -> DispatchResult<Option<IdempotencyRecord>> {
        self.store.get(key).await.map_err(DispatchError::store)
    }

    pub async fn purge_expired(&self) -> DispatchResult<usize> {
        self.store
            .purge_expired(self.clock.now())
            .await
            .map_err(DispatchError::store)
    }
}
