use std::sync::Arc;

use anyhow::{Error, Result};
use dispatch_service::{
    api::{AppState, run_api_server},
    clients::{
        circuit_breaker::CircuitBreaker,
        database::PgScheduledJobStore,
        directory::HttpDirectory,
        fcm::FcmPushDeliverer,
        gateway::HttpChannelGateway,
        health::{HealthChecker, HealthProbe},
        rbmq::RabbitMqDeadLetterSink,
        redis::RedisIdempotencyStore,
        template::HttpTemplateStore,
    },
    config::Config,
    models::notification::Channel,
    pipeline::{
        assembler::ContentAssembler,
        dispatcher::{Dispatcher, WorkerPool},
        guard::IdempotencyGuard,
        resolver::RecipientResolver,
        scheduler::Scheduler,
        service::NotificationService,
    },
    ports::{ChannelDeliverer, Clock, SystemClock},
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_current_span(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let config = Config::load()?;
    info!("Configuration validated");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let idempotency_store = Arc::new(RedisIdempotencyStore::connect(&config).await?);
    let scheduled_jobs = Arc::new(PgScheduledJobStore::connect(&config.database_url).await?);
    let delivery_log = Arc::new(scheduled_jobs.delivery_log());
    let dead_letters = Arc::new(RabbitMqDeadLetterSink::connect(&config).await?);

    let breaker = |name: &str| Arc::new(CircuitBreaker::new(name, config.circuit_breaker_config()));
    let template_breaker = breaker("template_service");
    let directory_breaker = breaker("directory_service");
    let email_breaker = breaker("email_gateway");
    let sms_breaker = breaker("sms_gateway");
    let fcm_breaker = breaker("fcm");

    let guard = Arc::new(IdempotencyGuard::new(
        idempotency_store.clone(),
        clock.clone(),
        config.guard_config(),
    ));

    let directory = Arc::new(HttpDirectory::new(&config, directory_breaker.clone())?);
    let resolver = Arc::new(RecipientResolver::new(directory, config.lookup_timeout()));

    let templates = Arc::new(HttpTemplateStore::new(&config, template_breaker.clone())?);
    let assembler = Arc::new(ContentAssembler::new(
        templates,
        config.content_limits(),
        config.lookup_timeout(),
        config.template_cache_ttl(),
    ));

    let deliverers: Vec<Arc<dyn ChannelDeliverer>> = vec![
        Arc::new(HttpChannelGateway::new(
            Channel::Email,
            &config.email_gateway_url,
            config.retry_config(),
            email_breaker.clone(),
        )?),
        Arc::new(HttpChannelGateway::new(
            Channel::Sms,
            &config.sms_gateway_url,
            config.retry_config(),
            sms_breaker.clone(),
        )?),
        Arc::new(FcmPushDeliverer::new(&config, fcm_breaker.clone()).await?),
    ];

    let dispatcher = Arc::new(Dispatcher::new(
        deliverers,
        resolver.clone(),
        assembler.clone(),
        dead_letters.clone(),
        delivery_log.clone(),
        guard.clone(),
        clock.clone(),
        config.dispatcher_config(),
    ));

    let (pool, workers) =
        WorkerPool::start(dispatcher, config.worker_concurrency, config.job_queue_capacity);

    let scheduler = Arc::new(Scheduler::new(
        scheduled_jobs.clone(),
        pool.clone(),
        guard.clone(),
        clock.clone(),
        config.scheduler_config(),
    ));

    match scheduler.pending_count().await {
        Ok(pending) => info!(pending, "Scheduled jobs waiting from previous runs"),
        Err(e) => warn!(error = %e, "Could not count pending scheduled jobs"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx));

    let service = Arc::new(NotificationService::new(
        guard,
        resolver,
        assembler,
        pool,
        scheduler,
        delivery_log,
        clock,
    ));

    let probes: Vec<Arc<dyn HealthProbe>> = vec![idempotency_store, scheduled_jobs, dead_letters];
    let health_checker = HealthChecker::new(
        probes,
        vec![
            template_breaker,
            directory_breaker,
            email_breaker,
            sms_breaker,
            fcm_breaker,
        ],
    );

    let state = Arc::new(AppState {
        service,
        health_checker,
    });

    run_api_server(config.server_port, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "Scheduler task ended abnormally");
    }

    // Workers drain the queue once the last pool handle is gone.
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Dispatch worker ended abnormally");
        }
    }

    info!("Dispatch service stopped");

    Ok(())
}
