use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use futures_util::{
    StreamExt, future,
    stream::{self, BoxStream},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{DispatchError, DispatchResult},
    models::{
        delivery::DeliveryRecord,
        message::{DeadLetter, DispatchJob, FinalMessage},
        notification::Channel,
        recipient::{Audience, ResolvedRecipient},
        status::{ChannelReport, DeliveryOutcome, FailedDelivery, JobReport, JobState},
    },
    pipeline::{
        assembler::ContentAssembler, guard::IdempotencyGuard, resolver::RecipientResolver,
    },
    ports::{ChannelDeliverer, Clock, DeadLetterSink, DeliveryLog},
};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// In-flight deliveries per channel of one job.
    pub delivery_concurrency: usize,
    pub broadcast_page_size: usize,
    /// Addresses remembered across broadcast pages for deduplication.
    pub broadcast_dedup_capacity: usize,
}

/// Fans a job out to its channels and folds the per-recipient results into a report.
///
/// A failed recipient never stops the others. Failures are published to the
/// dead letter sink and listed in the report. Every recipient's delivery is
/// tracked in the delivery log from `PENDING` to its final status.
pub struct Dispatcher {
    deliverers: HashMap<Channel, Arc<dyn ChannelDeliverer>>,
    resolver: Arc<RecipientResolver>,
    assembler: Arc<ContentAssembler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    delivery_log: Arc<dyn DeliveryLog>,
    guard: Arc<IdempotencyGuard>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        deliverers: Vec<Arc<dyn ChannelDeliverer>>,
        resolver: Arc<RecipientResolver>,
        assembler: Arc<ContentAssembler>,
        dead_letters: Arc<dyn DeadLetterSink>,
        delivery_log: Arc<dyn DeliveryLog>,
        guard: Arc<IdempotencyGuard>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        let deliverers = deliverers
            .into_iter()
            .map(|deliverer| (deliverer.channel(), deliverer))
            .collect();

        Self {
            deliverers,
            resolver,
            assembler,
            dead_letters,
            delivery_log,
            guard,
            clock,
            config,
        }
    }

    pub async fn run(self: &Arc<Self>, job: DispatchJob) -> JobReport {
        let job = Arc::new(job);

        info!(
            job_id = %job.job_id,
            idempotency_key = %job.idempotency_key,
            channels = job.messages.len(),
            "Dispatching job"
        );

        let mut channels: BTreeMap<Channel, ChannelReport> = job
            .channels()
            .map(|channel| {
                let unfinished =
                    ChannelReport::aborted(0, Vec::new(), "delivery task did not finish".into());
                (channel, unfinished)
            })
            .collect();

        let mut tasks = JoinSet::new();
        for channel in job.channels() {
            let this = Arc::clone(self);
            let job = Arc::clone(&job);
            tasks.spawn(async move {
                let report = this.dispatch_channel(&job, channel).await;
                (channel, report)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((channel, report)) => {
                    channels.insert(channel, report);
                }
                Err(e) => error!(job_id = %job.job_id, error = %e, "Channel delivery task failed"),
            }
        }

        let report = JobReport {
            job_id: job.job_id,
            state: JobState::Completed,
            channels,
            completed_at: self.clock.now(),
        };

        let delivered: u64 = report.channels.values().map(|c| c.delivered).sum();
        let failed: usize = report.channels.values().map(|c| c.failed.len()).sum();
        info!(
            job_id = %job.job_id,
            delivered,
            failed,
            "Job dispatch completed"
        );

        if let Err(e) = self.guard.record_report(&job.idempotency_key, &report).await {
            error!(job_id = %job.job_id, error = %e, "Failed to record job report");
        }

        report
    }

    async fn dispatch_channel(&self, job: &DispatchJob, channel: Channel) -> ChannelReport {
        let Some(deliverer) = self.deliverers.get(&channel) else {
            warn!(job_id = %job.job_id, channel = %channel, "No deliverer configured");
            return ChannelReport::aborted(
                0,
                Vec::new(),
                format!("no deliverer configured for {}", channel),
            );
        };

        let (Some(message), Some(sender)) = (job.messages.get(&channel), job.senders.get(&channel))
        else {
            return ChannelReport::aborted(
                0,
                Vec::new(),
                format!("job has no message or sender for {}", channel),
            );
        };

        let recipients = match job.audiences.get(&channel) {
            Some(Audience::Listed(list)) => stream::iter(list.clone().into_iter().map(Ok)).boxed(),
            Some(Audience::Broadcast) => self.broadcast(channel),
            None => stream::empty().boxed(),
        };

        let mut deliveries = recipients
            .map(|item| async move {
                let recipient = item?;
                let localized = self.localized(job, channel, &recipient).await;
                let message = localized.as_ref().unwrap_or(message);

                let mut record =
                    DeliveryRecord::pending(job.job_id, channel, recipient.clone(), self.clock.now());
                self.track(&record).await;

                let outcome = deliverer.deliver(message, &recipient, sender).await;

                let now = self.clock.now();
                let moved = match &outcome {
                    DeliveryOutcome::Success => record.mark_dispatched(now),
                    DeliveryOutcome::TerminalFailure(reason) => {
                        record.mark_failed(reason.as_str(), false, now)
                    }
                    DeliveryOutcome::Retryable(reason) => record.mark_failed(reason.as_str(), true, now),
                };
                match moved {
                    Ok(()) => self.track(&record).await,
                    Err(e) => warn!(message_id = %record.message_id, error = %e, "Delivery status not updated"),
                }

                Ok::<_, DispatchError>((recipient, outcome))
            })
            .buffer_unordered(self.config.delivery_concurrency.max(1));

        let mut delivered = 0u64;
        let mut failed = Vec::new();
        let mut broken = None;

        while let Some(result) = deliveries.next().await {
            match result {
                Ok((_, DeliveryOutcome::Success)) => delivered += 1,
                Ok((recipient, DeliveryOutcome::TerminalFailure(reason))) => {
                    failed.push(self.record_failure(job, channel, recipient, reason, false).await)
                }
                Ok((recipient, DeliveryOutcome::Retryable(reason))) => {
                    failed.push(self.record_failure(job, channel, recipient, reason, true).await)
                }
                Err(e) => {
                    error!(
                        job_id = %job.job_id,
                        channel = %channel,
                        error = %e,
                        "Recipient stream broke, channel stops after in-flight deliveries"
                    );
                    broken = Some(e.to_string());
                }
            }
        }

        debug!(
            job_id = %job.job_id,
            channel = %channel,
            delivered,
            failed = failed.len(),
            "Channel finished"
        );

        match broken {
            Some(reason) => ChannelReport::aborted(delivered, failed, reason),
            None => ChannelReport::from_counts(delivered, failed),
        }
    }

    /// The recipient's own translation, when the job is templated and one exists.
    async fn localized(
        &self,
        job: &DispatchJob,
        channel: Channel,
        recipient: &ResolvedRecipient,
    ) -> Option<FinalMessage> {
        let template = job.template.as_ref()?;
        let language = recipient.language.as_deref()?;

        match self.assembler.localize(template, channel, language).await {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    job_id = %job.job_id,
                    channel = %channel,
                    language,
                    error = %e,
                    "Translation unusable, sending default message"
                );
                None
            }
        }
    }

    async fn track(&self, record: &DeliveryRecord) {
        if let Err(e) = self.delivery_log.record(record).await {
            error!(
                message_id = %record.message_id,
                job_id = %record.job_id,
                status = %record.status,
                error = %e,
                "Failed to record delivery status"
            );
        }
    }

    fn broadcast(&self, channel: Channel) -> BoxStream<'static, DispatchResult<ResolvedRecipient>> {
        self.resolver
            .broadcast_pages(
                channel,
                self.config.broadcast_page_size,
                self.config.broadcast_dedup_capacity,
            )
            .flat_map(|page| match page {
                Ok(recipients) => stream::iter(recipients.into_iter().map(Ok)).left_stream(),
                Err(e) => stream::once(future::ready(Err(e))).right_stream(),
            })
            .boxed()
    }

    async fn record_failure(
        &self,
        job: &DispatchJob,
        channel: Channel,
        recipient: ResolvedRecipient,
        reason: String,
        retryable: bool,
    ) -> FailedDelivery {
        warn!(
            job_id = %job.job_id,
            channel = %channel,
            recipient = %recipient.address,
            retryable,
            reason = %reason,
            "Delivery failed"
        );

        let letter = DeadLetter {
            job_id: job.job_id,
            idempotency_key: job.idempotency_key.clone(),
            channel,
            recipient: recipient.clone(),
            failure_reason: reason.clone(),
            retryable,
            failed_at: self.clock.now().to_rfc3339(),
        };

        if let Err(e) = self.dead_letters.publish(&letter).await {
            error!(job_id = %job.job_id, error = %e, "Failed to publish dead letter");
        }

        FailedDelivery {
            recipient,
            reason,
            retryable,
        }
    }
}

/// Bounded queue of ready jobs drained by a fixed set of workers.
#[derive(Clone)]
pub struct WorkerPool {
    sender: mpsc::Sender<DispatchJob>,
}

impl WorkerPool {
    /// Starts `workers` tasks. They exit once every handle to the pool is dropped
    /// and the queue is drained.
    pub fn start(
        dispatcher: Arc<Dispatcher>,
        workers: usize,
        capacity: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let dispatcher = Arc::clone(&dispatcher);
                let receiver = Arc::clone(&receiver);

                tokio::spawn(async move {
                    debug!(worker_id, "Dispatch worker started");

                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job) = next else {
                            break;
                        };
                        dispatcher.run(job).await;
                    }

                    debug!(worker_id, "Dispatch worker stopped");
                })
            })
            .collect();

        info!(workers, capacity, "Worker pool started");

        (Self { sender }, handles)
    }

    /// Waits for queue space if every slot is taken.
    pub async fn submit(&self, job: DispatchJob) -> DispatchResult<()> {
        let job_id = job.job_id;

        self.sender
            .send(job)
            .await
            .map_err(|_| DispatchError::Store("dispatch queue is closed".to_string()))?;

        debug!(job_id = %job_id, "Job queued for dispatch");
        Ok(())
    }
}
