//! escrow-gateway server entry point.
//!
//! Depending on `APP_ROLE`, starts the Axum HTTP server, the background
//! worker, or both in one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use escrow_gateway::api;
use escrow_gateway::app_state::AppState;
use escrow_gateway::config::{GatewayConfig, LogFormat};
use escrow_gateway::domain::{Clock, EventBus, SystemClock};
use escrow_gateway::idempotency::{
    IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore,
};
use escrow_gateway::ledger::{InMemoryLedger, Ledger};
use escrow_gateway::persistence::{
    self, PostgresContentStore, PostgresDeadLetterStore, PostgresIdempotencyStore, PostgresLedger,
    RedisHandle,
};
use escrow_gateway::queue::{InMemoryJobQueue, JobQueue, RedisJobQueue};
use escrow_gateway::retry::{DeadLetterStore, InMemoryDeadLetterStore, RetryEngine};
use escrow_gateway::service::{EscrowService, JobService, notifier};
use escrow_gateway::worker::{
    Classifier, ContentStore, Embedder, EscrowReleaseHandler, Extractor, HttpCapabilityClient,
    InMemoryContentStore, JobDispatcher, JobRateLimiter, ModerationHandler,
    RecommendationHandler, UnconfiguredCapability, VerificationHandler, Worker,
};

/// Storage backends selected from configuration.
struct Backends {
    ledger: Arc<dyn Ledger>,
    queue: Arc<dyn JobQueue>,
    dead_letters: Arc<dyn DeadLetterStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    content: Arc<dyn ContentStore>,
}

/// AI capabilities used by the verification, moderation and
/// recommendation handlers.
struct Capabilities {
    extractor: Arc<dyn Extractor>,
    classifier: Arc<dyn Classifier>,
    embedder: Arc<dyn Embedder>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().map_err(|e| anyhow::anyhow!("configuration: {e}"))?;
    init_tracing(config.log_format);
    tracing::info!(
        addr = %config.listen_addr,
        role = ?config.role,
        persistence = config.persistence_enabled,
        redis = config.redis_url.is_some(),
        "starting escrow-gateway"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let event_bus = EventBus::new(config.event_bus_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let backends = build_backends(&config, Arc::clone(&clock)).await?;

    let escrow = EscrowService::new(
        Arc::clone(&backends.ledger),
        Arc::clone(&backends.queue),
        event_bus.clone(),
        Arc::clone(&clock),
        config.escrow_settings(),
    );
    let jobs = JobService::new(
        Arc::clone(&backends.queue),
        Arc::clone(&backends.dead_letters),
        Arc::clone(&clock),
    );
    let guard = IdempotencyGuard::new(Arc::clone(&backends.idempotency), Arc::clone(&clock));

    let mut tasks = vec![];
    let forwarder = notifier::spawn_forwarder(&event_bus, shutdown_rx.clone());

    if config.role.runs_worker() {
        let capabilities = build_capabilities(&config)?;
        let dispatcher = JobDispatcher::new(
            VerificationHandler::new(
                capabilities.extractor,
                Arc::clone(&backends.content),
                event_bus.clone(),
                Arc::clone(&clock),
            ),
            ModerationHandler::new(
                capabilities.classifier,
                Arc::clone(&backends.content),
                event_bus.clone(),
                Arc::clone(&clock),
            ),
            RecommendationHandler::new(
                capabilities.embedder,
                Arc::clone(&backends.content),
                Arc::clone(&clock),
            ),
            EscrowReleaseHandler::new(escrow.clone()),
        );
        let engine = RetryEngine::new(
            config.backoff_policy(),
            Arc::clone(&backends.queue),
            Arc::clone(&backends.dead_letters),
            event_bus.clone(),
            Arc::clone(&clock),
        );
        let worker = Arc::new(Worker::new(
            Arc::clone(&backends.queue),
            engine,
            Arc::new(dispatcher),
            JobRateLimiter::per_second(config.worker_rate_limit_per_sec),
            escrow.clone(),
            Arc::clone(&backends.idempotency),
            Arc::clone(&backends.content),
            Arc::clone(&clock),
            config.worker_settings(),
        ));
        tasks.extend(worker.start(shutdown_rx.clone()).await?);
    }

    if config.role.runs_api() {
        let app_state = AppState {
            escrow,
            jobs,
            guard,
            event_bus,
            role: config.role,
        };
        let app = Router::new()
            .merge(api::build_router())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(app_state);

        let listener = tokio::net::TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("binding {}", config.listen_addr))?;
        tracing::info!(addr = %config.listen_addr, "server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
            .await?;
    } else {
        shutdown_signal(shutdown_tx.clone()).await;
    }

    // The server may have stopped on its own; make sure background tasks see it.
    shutdown_tx.send_replace(true);
    for task in tasks {
        if let Err(err) = task.await {
            tracing::error!(error = %err, "background task ended abnormally");
        }
    }
    match forwarder.await {
        Ok(forwarded) => tracing::info!(forwarded, "event forwarder stopped"),
        Err(err) => tracing::error!(error = %err, "event forwarder ended abnormally"),
    }
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn build_backends(config: &GatewayConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Backends> {
    let ttl = config.idempotency_ttl();

    let (ledger, dead_letters, content, durable_idempotency): (
        Arc<dyn Ledger>,
        Arc<dyn DeadLetterStore>,
        Arc<dyn ContentStore>,
        Arc<dyn IdempotencyStore>,
    ) = if config.persistence_enabled {
        let pool = persistence::connect(config)
            .await
            .context("connecting to PostgreSQL")?;
        persistence::migrate(&pool)
            .await
            .context("running migrations")?;
        tracing::info!("PostgreSQL persistence enabled");
        (
            Arc::new(PostgresLedger::new(pool.clone())),
            Arc::new(PostgresDeadLetterStore::new(pool.clone())),
            Arc::new(PostgresContentStore::new(pool.clone())),
            Arc::new(PostgresIdempotencyStore::new(pool, ttl)),
        )
    } else {
        tracing::warn!("persistence disabled, all state is in memory");
        (
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryDeadLetterStore::new()),
            Arc::new(InMemoryContentStore::new()),
            Arc::new(InMemoryIdempotencyStore::new(ttl)),
        )
    };

    let (queue, idempotency): (Arc<dyn JobQueue>, Arc<dyn IdempotencyStore>) =
        match &config.redis_url {
            Some(url) => {
                let redis = Arc::new(RedisHandle::open(url).context("parsing REDIS_URL")?);
                let mut store = RedisIdempotencyStore::new(Arc::clone(&redis), ttl);
                if config.persistence_enabled {
                    store = store.with_fallback(durable_idempotency);
                }
                let mut queue = RedisJobQueue::new(redis, clock);
                if let Some(consumer_id) = &config.queue_consumer_id {
                    queue = queue.with_consumer_id(consumer_id.as_str());
                }
                tracing::info!(consumer_id = queue.consumer_id(), "Redis job queue enabled");
                (Arc::new(queue), Arc::new(store))
            }
            None => {
                tracing::warn!("REDIS_URL not set, using the in-process job queue");
                (Arc::new(InMemoryJobQueue::new(clock)), durable_idempotency)
            }
        };

    Ok(Backends {
        ledger,
        queue,
        dead_letters,
        idempotency,
        content,
    })
}

fn build_capabilities(config: &GatewayConfig) -> anyhow::Result<Capabilities> {
    match &config.ai_service_url {
        Some(url) => {
            let client = Arc::new(
                HttpCapabilityClient::new(
                    url.as_str(),
                    config.ai_service_api_key.clone(),
                    Duration::from_secs(config.ai_request_timeout_secs),
                )
                .context("building AI service client")?,
            );
            Ok(Capabilities {
                extractor: Arc::clone(&client) as Arc<dyn Extractor>,
                classifier: Arc::clone(&client) as Arc<dyn Classifier>,
                embedder: client,
            })
        }
        None => {
            tracing::warn!("AI_SERVICE_URL not set, capability jobs will be discarded");
            let capability = Arc::new(UnconfiguredCapability);
            Ok(Capabilities {
                extractor: Arc::clone(&capability) as Arc<dyn Extractor>,
                classifier: Arc::clone(&capability) as Arc<dyn Classifier>,
                embedder: capability,
            })
        }
    }
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
    shutdown.send_replace(true);
}
