use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dispatch_service::{
    clients::memory::{
        ManualClock, MemoryDeliveryLog, MemoryIdempotencyStore, MemoryScheduledJobStore,
    },
    config::Config,
    models::{
        idempotency::GuardConfig,
        message::{ContentLimits, DeadLetter, FinalMessage},
        notification::{Channel, SenderIdentity},
        recipient::{BroadcastContact, ContactPage, ResolvedRecipient, UserContacts},
        request::NotificationCreateRequest,
        status::{DeliveryOutcome, JobStatusView},
        template::TemplateDefinition,
    },
    pipeline::{
        assembler::ContentAssembler,
        dispatcher::{Dispatcher, DispatcherConfig, WorkerPool},
        guard::IdempotencyGuard,
        resolver::RecipientResolver,
        scheduler::{Scheduler, SchedulerConfig},
        service::NotificationService,
    },
    ports::{
        ChannelDeliverer, Clock, ContactDirectory, DeadLetterSink, DeliveryLog, IdempotencyStore,
        ScheduledJobStore, TemplateStore,
    },
};
use serde_json::Value;
use tokio::sync::watch;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 18, 9, 0, 0).unwrap()
}

pub fn request(body: Value) -> NotificationCreateRequest {
    serde_json::from_value(body).expect("test body should decode")
}

/// EMAIL + SMS to two known users with direct content.
pub fn order_shipped_body() -> Value {
    serde_json::json!({
        "requester": { "type": "SERVICE", "id": "order-service" },
        "recipients": { "userIds": ["user-1", "user-2"] },
        "notificationTypes": ["EMAIL", "SMS"],
        "senderInfos": {
            "EMAIL": {
                "senderEmailAddress": "no-reply@shop.example.com",
                "senderName": "Shop"
            },
            "SMS": {
                "senderPhoneNumber": "15880000",
                "senderName": "Shop"
            }
        },
        "content": {
            "title": "Order shipped",
            "body": "ORD-20250618-001 is on its way"
        }
    })
}

pub fn test_config(base_url: &str) -> Config {
    Config {
        redis_url: "redis://127.0.0.1:6379".to_string(),
        idempotency_ttl_seconds: 86_400,
        idempotency_in_flight_ttl_seconds: 60,
        idempotency_wait_timeout_ms: 1_000,
        idempotency_poll_interval_ms: 10,
        database_url: "postgres://localhost/dispatch".to_string(),
        rabbitmq_url: "amqp://localhost:5672".to_string(),
        failed_queue_name: "notifications.failed".to_string(),
        template_service_url: base_url.to_string(),
        directory_service_url: base_url.to_string(),
        email_gateway_url: format!("{}/email/send", base_url),
        sms_gateway_url: format!("{}/sms/send", base_url),
        fcm_project_id: "test-project".to_string(),
        lookup_timeout_ms: 2_000,
        broadcast_page_size: 2,
        broadcast_dedup_capacity: 1_000,
        template_cache_ttl_seconds: 0,
        max_email_bytes: 256 * 1024,
        max_sms_bytes: 2000,
        max_push_bytes: 4096,
        circuit_breaker_failure_threshold: 5,
        circuit_breaker_timeout_seconds: 30,
        circuit_breaker_success_threshold: 2,
        max_retry_attempts: 3,
        initial_retry_delay_ms: 10,
        max_retry_delay_ms: 50,
        retry_backoff_multiplier: 2,
        worker_concurrency: 2,
        delivery_concurrency: 4,
        job_queue_capacity: 16,
        scheduler_poll_interval_ms: 50,
        scheduler_batch_size: 10,
        server_port: 0,
    }
}

/// Records every delivery. Addresses listed in `scripted` get that outcome, the rest succeed.
pub struct RecordingDeliverer {
    channel: Channel,
    scripted: HashMap<String, DeliveryOutcome>,
    gate: Option<watch::Receiver<bool>>,
    sent: Mutex<Vec<(String, FinalMessage, SenderIdentity)>>,
}

impl RecordingDeliverer {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            scripted: HashMap::new(),
            gate: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Holds every delivery until `true` is sent on the returned channel.
    pub fn gated(mut self) -> (Self, watch::Sender<bool>) {
        let (open, gate) = watch::channel(false);
        self.gate = Some(gate);
        (self, open)
    }

    pub fn with_outcome(mut self, address: &str, outcome: DeliveryOutcome) -> Self {
        self.scripted.insert(address.to_string(), outcome);
        self
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(address, _, _)| address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    pub fn messages(&self) -> Vec<FinalMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message, _)| message.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelDeliverer for RecordingDeliverer {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(
        &self,
        message: &FinalMessage,
        recipient: &ResolvedRecipient,
        sender: &SenderIdentity,
    ) -> DeliveryOutcome {
        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            gate.wait_for(|open| *open).await.expect("gate sender dropped");
        }

        self.sent.lock().unwrap().push((
            recipient.address.clone(),
            message.clone(),
            sender.clone(),
        ));

        self.scripted
            .get(&recipient.address)
            .cloned()
            .unwrap_or(DeliveryOutcome::Success)
    }
}

/// Directory backed by maps. Broadcast pages are addressed by `page-{n}` cursors.
#[derive(Default)]
pub struct FakeDirectory {
    users: HashMap<String, UserContacts>,
    segments: HashMap<String, Vec<String>>,
    pages: Vec<Vec<BroadcastContact>>,
    broken_page: Option<usize>,
    delay: Option<Duration>,
    lookups: AtomicUsize,
    page_requests: AtomicUsize,
}

impl FakeDirectory {
    pub fn with_user(mut self, user_id: &str, contacts: UserContacts) -> Self {
        self.users.insert(user_id.to_string(), contacts);
        self
    }

    pub fn with_phone_user(self, user_id: &str, phone: &str) -> Self {
        self.with_user(
            user_id,
            UserContacts {
                phone_number: Some(phone.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn with_segment(mut self, name: &str, user_ids: &[&str]) -> Self {
        self.segments.insert(
            name.to_string(),
            user_ids.iter().map(|id| id.to_string()).collect(),
        );
        self
    }

    pub fn with_page(mut self, contacts: &[(&str, &str)]) -> Self {
        self.pages.push(
            contacts
                .iter()
                .map(|(user_id, address)| BroadcastContact {
                    user_id: user_id.to_string(),
                    address: address.to_string(),
                    language: None,
                })
                .collect(),
        );
        self
    }

    pub fn with_broken_page(mut self, index: usize) -> Self {
        self.broken_page = Some(index);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContactDirectory for FakeDirectory {
    async fn lookup_contacts(
        &self,
        user_ids: &[String],
        _channels: &std::collections::BTreeSet<Channel>,
    ) -> Result<HashMap<String, UserContacts>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        Ok(user_ids
            .iter()
            .filter_map(|id| self.users.get(id).map(|c| (id.clone(), c.clone())))
            .collect())
    }

    async fn resolve_segment(&self, name: &str) -> Result<Option<Vec<String>>> {
        self.pause().await;
        Ok(self.segments.get(name).cloned())
    }

    async fn list_all_users(
        &self,
        _channel: Channel,
        cursor: Option<&str>,
        _page_size: usize,
    ) -> Result<ContactPage> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);

        let index = match cursor {
            None => 0,
            Some(cursor) => cursor
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| anyhow!("unknown cursor {}", cursor))?,
        };

        if self.broken_page == Some(index) {
            return Err(anyhow!("directory unavailable"));
        }

        let contacts = self.pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < self.pages.len()).then(|| format!("page-{}", index + 1));

        Ok(ContactPage {
            contacts,
            next_cursor,
        })
    }
}

/// Templates keyed by (id, channel, language). A language with no entry has no translation.
#[derive(Default)]
pub struct FakeTemplates {
    definitions: HashMap<(String, Channel, Option<String>), TemplateDefinition>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl FakeTemplates {
    pub fn with(mut self, definition: TemplateDefinition) -> Self {
        self.definitions.insert(
            (
                definition.template_id.clone(),
                definition.channel,
                definition.language.clone(),
            ),
            definition,
        );
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TemplateStore for FakeTemplates {
    async fn get_template(
        &self,
        template_id: &str,
        channel: Channel,
        language: Option<&str>,
    ) -> Result<Option<TemplateDefinition>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self
            .definitions
            .get(&(template_id.to_string(), channel, language.map(str::to_string)))
            .cloned())
    }
}

#[derive(Default)]
pub struct RecordingDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl RecordingDeadLetters {
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetters {
    async fn publish(&self, letter: &DeadLetter) -> Result<()> {
        self.letters.lock().unwrap().push(letter.clone());
        Ok(())
    }
}

/// Collaborators a [`Harness`] is wired from. Defaults to empty fakes.
pub struct HarnessBuilder {
    pub directory: FakeDirectory,
    pub templates: FakeTemplates,
    pub email: RecordingDeliverer,
    pub sms: RecordingDeliverer,
    pub push: RecordingDeliverer,
    pub guard_config: GuardConfig,
    pub lookup_timeout: Duration,
    pub limits: ContentLimits,
    pub page_size: usize,
    pub dedup_capacity: usize,
    pub template_cache_ttl: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            directory: FakeDirectory::default(),
            templates: FakeTemplates::default(),
            email: RecordingDeliverer::new(Channel::Email),
            sms: RecordingDeliverer::new(Channel::Sms),
            push: RecordingDeliverer::new(Channel::Push),
            guard_config: GuardConfig {
                wait_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
            lookup_timeout: Duration::from_secs(2),
            limits: ContentLimits::default(),
            page_size: 2,
            dedup_capacity: 1_000,
            template_cache_ttl: Duration::ZERO,
            workers: 2,
            queue_capacity: 16,
        }
    }
}

impl HarnessBuilder {
    pub fn build(self) -> Harness {
        let clock = Arc::new(ManualClock::new(start_time()));
        let idempotency = Arc::new(MemoryIdempotencyStore::new(clock.clone()));
        let scheduled = Arc::new(MemoryScheduledJobStore::new());
        let directory = Arc::new(self.directory);
        let email = Arc::new(self.email);
        let sms = Arc::new(self.sms);
        let push = Arc::new(self.push);
        let templates = Arc::new(self.templates);
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let delivery_log = Arc::new(MemoryDeliveryLog::new());

        let guard = Arc::new(IdempotencyGuard::new(
            idempotency.clone() as Arc<dyn IdempotencyStore>,
            clock.clone() as Arc<dyn Clock>,
            self.guard_config,
        ));

        let resolver = Arc::new(RecipientResolver::new(
            directory.clone() as Arc<dyn ContactDirectory>,
            self.lookup_timeout,
        ));
        let assembler = Arc::new(ContentAssembler::new(
            templates.clone() as Arc<dyn TemplateStore>,
            self.limits,
            self.lookup_timeout,
            self.template_cache_ttl,
        ));

        let deliverers: Vec<Arc<dyn ChannelDeliverer>> =
            vec![email.clone(), sms.clone(), push.clone()];

        let dispatcher = Arc::new(Dispatcher::new(
            deliverers,
            resolver.clone(),
            assembler.clone(),
            dead_letters.clone(),
            delivery_log.clone() as Arc<dyn DeliveryLog>,
            guard.clone(),
            clock.clone(),
            DispatcherConfig {
                delivery_concurrency: 4,
                broadcast_page_size: self.page_size,
                broadcast_dedup_capacity: self.dedup_capacity,
            },
        ));

        let (pool, _workers) = WorkerPool::start(dispatcher, self.workers, self.queue_capacity);

        let scheduler = Arc::new(Scheduler::new(
            scheduled.clone() as Arc<dyn ScheduledJobStore>,
            pool.clone(),
            guard.clone(),
            clock.clone(),
            SchedulerConfig {
                poll_interval: Duration::from_millis(20),
                batch_size: 10,
            },
        ));

        let service = Arc::new(NotificationService::new(
            guard.clone(),
            resolver,
            assembler,
            pool,
            scheduler.clone(),
            delivery_log.clone() as Arc<dyn DeliveryLog>,
            clock.clone(),
        ));

        Harness {
            clock,
            idempotency,
            scheduled,
            directory,
            templates,
            email,
            sms,
            push,
            dead_letters,
            delivery_log,
            guard,
            scheduler,
            service,
        }
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub idempotency: Arc<MemoryIdempotencyStore>,
    pub scheduled: Arc<MemoryScheduledJobStore>,
    pub directory: Arc<FakeDirectory>,
    pub templates: Arc<FakeTemplates>,
    pub email: Arc<RecordingDeliverer>,
    pub sms: Arc<RecordingDeliverer>,
    pub push: Arc<RecordingDeliverer>,
    pub dead_letters: Arc<RecordingDeadLetters>,
    pub delivery_log: Arc<MemoryDeliveryLog>,
    pub guard: Arc<IdempotencyGuard>,
    pub scheduler: Arc<Scheduler>,
    pub service: Arc<NotificationService>,
}

impl Harness {
    /// Polls the status endpoint until the dispatcher has attached a report.
    pub async fn wait_for_report(&self, key: &str) -> JobStatusView {
        for _ in 0..300 {
            let view = self.service.status(key).await.expect("status lookup");
            if view.report.is_some() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("no dispatch report for {} after 3s", key);
    }
}
