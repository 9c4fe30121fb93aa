use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Notify, watch},
    time::sleep,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{DispatchError, DispatchResult},
    models::{
        message::DispatchJob,
        status::{JobReport, JobState},
    },
    pipeline::{dispatcher::WorkerPool, guard::IdempotencyGuard},
    ports::{Clock, ScheduledJobStore},
};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Longest sleep between due-job checks.
    pub poll_interval: Duration,
    pub batch_size: usize,
}

/// Holds jobs until their fire time, then hands them to the worker pool.
pub struct Scheduler {
    store: Arc<dyn ScheduledJobStore>,
    pool: WorkerPool,
    guard: Arc<IdempotencyGuard>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduledJobStore>,
        pool: WorkerPool,
        guard: Arc<IdempotencyGuard>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            pool,
            guard,
            clock,
            config,
            wake: Notify::new(),
        }
    }

    pub async fn schedule(&self, job: &DispatchJob) -> DispatchResult<()> {
        let fire_at = job.scheduled_at.ok_or_else(|| {
            DispatchError::Validation("scheduled job has no fire time".to_string())
        })?;

        self.store
            .schedule(job, fire_at)
            .await
            .map_err(DispatchError::store)?;

        info!(
            job_id = %job.job_id,
            fire_at = %fire_at.to_rfc3339(),
            "Job scheduled"
        );

        // An earlier fire time than the current sleep target must cut the sleep short.
        self.wake.notify_one();
        Ok(())
    }

    /// Claims every job due now and queues it for dispatch. Returns how many fired.
    pub async fn tick(&self) -> DispatchResult<usize> {
        let mut fired = 0;

        loop {
            let now = self.clock.now();
            let due = self
                .store
                .claim_due(now, self.config.batch_size)
                .await
                .map_err(DispatchError::store)?;

            let claimed = due.len();

            let mut due = due.into_iter();

            while let Some(job) = due.next() {
                let job_id = job.job_id;

                if let Err(e) = self.pool.submit(job.clone()).await {
                    error!(job_id = %job_id, error = %e, "Could not queue due jobs, putting them back");
                    for unsent in std::iter::once(job).chain(due) {
                        self.store
                            .schedule(&unsent, unsent.scheduled_at.unwrap_or(now))
                            .await
                            .map_err(DispatchError::store)?;
                    }
                    return Err(e);
                }

                debug!(job_id = %job_id, "Scheduled job fired");
                fired += 1;
            }

            if claimed < self.config.batch_size {
                break;
            }
        }

        if fired > 0 {
            info!(fired, "Scheduled jobs released");
        }

        Ok(fired)
    }

    /// Removes a pending job. Jobs that already fired cannot be cancelled.
    pub async fn cancel(&self, job_id: Uuid) -> DispatchResult<DispatchJob> {
        let job = self
            .store
            .cancel(job_id)
            .await
            .map_err(DispatchError::store)?
            .ok_or_else(|| DispatchError::JobNotFound(job_id.to_string()))?;

        let report = JobReport {
            job_id,
            state: JobState::Cancelled,
            channels: Default::default(),
            completed_at: self.clock.now(),
        };

        if !self.guard.record_report(&job.idempotency_key, &report).await? {
            warn!(job_id = %job_id, "Cancelled job has no idempotency record left");
        }

        info!(job_id = %job_id, idempotency_key = %job.idempotency_key, "Scheduled job cancelled");
        Ok(job)
    }

    pub async fn pending_count(&self) -> DispatchResult<usize> {
        self.store
            .pending_count()
            .await
            .map_err(DispatchError::store)
    }

    /// Fires due jobs until `shutdown` flips or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Scheduler started"
        );

        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduler tick failed");
            }

            match self.guard.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "Expired idempotency records purged"),
                Err(e) => warn!(error = %e, "Idempotency purge failed"),
            }

            let delay = self.next_delay().await;

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    async fn next_delay(&self) -> Duration {
        let next = match self.store.next_fire_time().await {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "Could not read next fire time");
                None
            }
        };

        match next {
            Some(fire_at) => (fire_at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.config.poll_interval),
            None => self.config.poll_interval,
        }
    }
}
