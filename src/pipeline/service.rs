use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::{DispatchError, DispatchResult},
    models::{
        delivery::DeliveryRecord,
        idempotency::{Admission, AdmissionTicket},
        message::DispatchJob,
        notification::MessageContent,
        request::NotificationCreateRequest,
        status::{JobState, JobStatusView, SubmitOutcome},
    },
    pipeline::{
        assembler::ContentAssembler, dispatcher::WorkerPool, guard::IdempotencyGuard,
        resolver::RecipientResolver, scheduler::Scheduler, validator,
    },
    ports::{Clock, DeliveryLog},
    utils::fingerprint,
};

/// Entry point of the pipeline: guard, validate, resolve, assemble, then hand off.
pub struct NotificationService {
    guard: Arc<IdempotencyGuard>,
    resolver: Arc<RecipientResolver>,
    assembler: Arc<ContentAssembler>,
    pool: WorkerPool,
    scheduler: Arc<Scheduler>,
    delivery_log: Arc<dyn DeliveryLog>,
    clock: Arc<dyn Clock>,
}

/// An admitted key that is released if the request is dropped before its
/// outcome is settled.
struct Reservation {
    guard: Arc<IdempotencyGuard>,
    ticket: AdmissionTicket,
    armed: bool,
}

impl Reservation {
    fn new(guard: Arc<IdempotencyGuard>, ticket: AdmissionTicket) -> Self {
        Self {
            guard,
            ticket,
            armed: true,
        }
    }

    fn ticket(&self) -> &AdmissionTicket {
        &self.ticket
    }

    fn disarm(mut self) -> AdmissionTicket {
        self.armed = false;
        self.ticket.clone()
    }

    async fn release(mut self) {
        self.armed = false;
        abandon_logged(&self.guard, &self.ticket).await;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(idempotency_key = %self.ticket.key, "No runtime to release dropped reservation");
            return;
        };

        warn!(idempotency_key = %self.ticket.key, "Request dropped before acceptance, releasing key");

        let guard = Arc::clone(&self.guard);
        let ticket = self.ticket.clone();
        runtime.spawn(async move { abandon_logged(&guard, &ticket).await });
    }
}

async fn abandon_logged(guard: &IdempotencyGuard, ticket: &AdmissionTicket) {
    if let Err(e) = guard.abandon(ticket).await {
        error!(idempotency_key = %ticket.key, error = %e, "Failed to release idempotency key");
    }
}

impl NotificationService {
    pub fn new(
        guard: Arc<IdempotencyGuard>,
        resolver: Arc<RecipientResolver>,
        assembler: Arc<ContentAssembler>,
        pool: WorkerPool,
        scheduler: Arc<Scheduler>,
        delivery_log: Arc<dyn DeliveryLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            guard,
            resolver,
            assembler,
            pool,
            scheduler,
            delivery_log,
            clock,
        }
    }

    /// Submits a creation request under `idempotency_key`.
    ///
    /// Non-retryable rejections come back as `Ok(SubmitOutcome::Rejected)` so
    /// that the first answer and every replay of it look the same. Errors are
    /// reserved for failures the caller may retry with the same key, and for
    /// misuse of the key itself.
    ///
    /// Dropping the returned future before a job exists releases the key.
    /// Once a job exists, recording and hand-off finish even if it is dropped.
    pub async fn submit(
        &self,
        idempotency_key: Option<&str>,
        body: &NotificationCreateRequest,
    ) -> DispatchResult<SubmitOutcome> {
        let fingerprint = fingerprint(&body.normalized()).map_err(DispatchError::store)?;

        let ticket = match self.guard.admit(idempotency_key, &fingerprint).await? {
            Admission::Proceed(ticket) => ticket,
            Admission::Replay(outcome) => return Ok(outcome),
            Admission::Conflict => return Err(DispatchError::Conflict),
        };
        let reservation = Reservation::new(Arc::clone(&self.guard), ticket);

        let job = match self.prepare(reservation.ticket(), body).await {
            Ok(job) => job,
            Err(e) if e.is_retryable() => {
                warn!(idempotency_key = %reservation.ticket().key, error = %e, "Request failed, key released for retry");
                reservation.release().await;
                return Err(e);
            }
            Err(e) => {
                info!(idempotency_key = %reservation.ticket().key, code = e.code(), error = %e, "Request rejected");
                let rejected = SubmitOutcome::Rejected {
                    code: e.code().to_string(),
                    reason: e.to_string(),
                };
                self.guard.complete(reservation.ticket(), &rejected).await?;
                reservation.disarm();
                return Ok(rejected);
            }
        };

        let ticket = reservation.disarm();
        let task = tokio::spawn(hand_off(
            Arc::clone(&self.guard),
            self.pool.clone(),
            Arc::clone(&self.scheduler),
            ticket,
            job,
        ));

        task.await
            .map_err(|e| DispatchError::Store(format!("job hand-off task failed: {}", e)))?
    }

    async fn prepare(
        &self,
        ticket: &AdmissionTicket,
        body: &NotificationCreateRequest,
    ) -> DispatchResult<DispatchJob> {
        let now = self.clock.now();
        let request = validator::validate(body, now)?;

        let audiences = self
            .resolver
            .resolve(&request.recipients, &request.channels)
            .await?;
        let messages = self
            .assembler
            .assemble_all(&request.content, &request.channels)
            .await?;

        let template = match request.content {
            MessageContent::Template(template) => Some(template),
            MessageContent::Direct(_) => None,
        };

        Ok(DispatchJob {
            job_id: Uuid::new_v4(),
            idempotency_key: ticket.key.clone(),
            requester: request.requester,
            memo: request.memo,
            audiences,
            messages,
            template,
            senders: request.senders,
            scheduled_at: request.scheduled_at,
            accepted_at: now,
        })
    }

    pub async fn status(&self, idempotency_key: &str) -> DispatchResult<JobStatusView> {
        let record = self
            .guard
            .lookup(idempotency_key)
            .await?
            .ok_or_else(|| DispatchError::JobNotFound(idempotency_key.to_string()))?;

        Ok(JobStatusView::new(record.key, record.outcome, record.report))
    }

    /// Per-recipient delivery status of the job accepted under `idempotency_key`.
    /// Empty until dispatch starts, and for rejected requests.
    pub async fn deliveries(&self, idempotency_key: &str) -> DispatchResult<Vec<DeliveryRecord>> {
        let view = self.status(idempotency_key).await?;

        let Some(job_id) = view.outcome.as_ref().and_then(SubmitOutcome::job_id) else {
            return Ok(Vec::new());
        };

        self.delivery_log
            .for_job(job_id)
            .await
            .map_err(DispatchError::store)
    }

    pub async fn cancel(&self, job_id: Uuid) -> DispatchResult<JobStatusView> {
        let job = self.scheduler.cancel(job_id).await?;

        match self.guard.lookup(&job.idempotency_key).await? {
            Some(record) => Ok(JobStatusView::new(record.key, record.outcome, record.report)),
            None => Ok(JobStatusView {
                idempotency_key: job.idempotency_key,
                state: JobState::Cancelled,
                outcome: None,
                report: None,
            }),
        }
    }
}

/// Records the acceptance outcome, then queues or schedules the job. Runs as
/// its own task so a dropped request cannot leave an accepted key without a
/// job. On failure the key is released again.
async fn hand_off(
    guard: Arc<IdempotencyGuard>,
    pool: WorkerPool,
    scheduler: Arc<Scheduler>,
    ticket: AdmissionTicket,
    job: DispatchJob,
) -> DispatchResult<SubmitOutcome> {
    let outcome = match job.scheduled_at {
        Some(fire_at) => SubmitOutcome::Scheduled {
            job_id: job.job_id,
            fire_at,
        },
        None => SubmitOutcome::Accepted { job_id: job.job_id },
    };

    // The outcome must be stored before a worker can attach a report to it.
    if let Err(e) = guard.complete(&ticket, &outcome).await {
        abandon_logged(&guard, &ticket).await;
        return Err(e);
    }

    let queued = match job.scheduled_at {
        Some(_) => scheduler.schedule(&job).await,
        None => pool.submit(job.clone()).await,
    };

    if let Err(e) = queued {
        error!(job_id = %job.job_id, error = %e, "Job hand-off failed, key released for retry");
        abandon_logged(&guard, &ticket).await;
        return Err(e);
    }

    info!(
        job_id = %job.job_id,
        idempotency_key = %job.idempotency_key,
        requester = %job.requester.id,
        channels = job.messages.len(),
        scheduled = job.scheduled_at.is_some(),
        "Notification request accepted"
    );

    Ok(outcome)
}
