//! Shared harness for the integration tests.
//!
//! Builds the full application over in-memory backends and a
//! [`ManualClock`], so escrow windows and retry delays can be crossed
//! without sleeping.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use escrow_gateway::api;
use escrow_gateway::app_state::AppState;
use escrow_gateway::config::AppRole;
use escrow_gateway::domain::{Clock, EventBus, Listing, ManualClock, SubjectRef, UserId};
use escrow_gateway::idempotency::{IdempotencyGuard, IdempotencyStore, InMemoryIdempotencyStore};
use escrow_gateway::ledger::InMemoryLedger;
use escrow_gateway::queue::{InMemoryJobQueue, JobQueue};
use escrow_gateway::retry::{BackoffPolicy, DeadLetterStore, InMemoryDeadLetterStore, RetryEngine};
use escrow_gateway::service::{EscrowService, EscrowSettings, JobService};
use escrow_gateway::worker::{
    Classifier, ContentStore, Embedder, EscrowReleaseHandler, Extractor, HttpCapabilityClient,
    InMemoryContentStore, JobDispatcher, JobRateLimiter, ModerationHandler,
    RecommendationHandler, VerificationHandler, Worker, WorkerSettings,
};

/// Application wired over in-memory storage.
pub struct TestApp {
    pub router: Router,
    pub clock: Arc<ManualClock>,
    pub queue: Arc<InMemoryJobQueue>,
    pub dead_letters: Arc<InMemoryDeadLetterStore>,
    pub content: Arc<InMemoryContentStore>,
    pub escrow: EscrowService,
    pub jobs: JobService,
    pub worker: Arc<Worker>,
    pub event_bus: EventBus,
}

/// Retry policy with no jitter: delays of 1s then 2s, dead letter on the
/// third failure.
pub fn test_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 2,
        initial_delay: Duration::from_secs(1),
        multiplier: 2.0,
        max_delay: Duration::from_secs(16),
        jitter_ratio: 0.0,
    }
}

pub fn build_app() -> TestApp {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let dyn_clock: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
    let event_bus = EventBus::new(64);

    let queue = Arc::new(InMemoryJobQueue::new(Arc::clone(&dyn_clock)));
    let dyn_queue: Arc<dyn JobQueue> = Arc::clone(&queue) as Arc<dyn JobQueue>;
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
    let dyn_dead_letters: Arc<dyn DeadLetterStore> =
        Arc::clone(&dead_letters) as Arc<dyn DeadLetterStore>;
    let content = Arc::new(InMemoryContentStore::new());
    let dyn_content: Arc<dyn ContentStore> = Arc::clone(&content) as Arc<dyn ContentStore>;
    let idempotency: Arc<dyn IdempotencyStore> =
        Arc::new(InMemoryIdempotencyStore::new(chrono::Duration::hours(24)));

    let escrow = EscrowService::new(
        Arc::new(InMemoryLedger::new()),
        Arc::clone(&dyn_queue),
        event_bus.clone(),
        Arc::clone(&dyn_clock),
        EscrowSettings::default(),
    );
    let jobs = JobService::new(
        Arc::clone(&dyn_queue),
        Arc::clone(&dyn_dead_letters),
        Arc::clone(&dyn_clock),
    );
    let guard = IdempotencyGuard::new(Arc::clone(&idempotency), Arc::clone(&dyn_clock));

    // Nothing listens on the discard port, so every capability call fails
    // with a retryable connection error.
    let capability = Arc::new(
        HttpCapabilityClient::new("http://127.0.0.1:9", None, Duration::from_millis(200)).unwrap(),
    );
    let dispatcher = JobDispatcher::new(
        VerificationHandler::new(
            Arc::clone(&capability) as Arc<dyn Extractor>,
            Arc::clone(&dyn_content),
            event_bus.clone(),
            Arc::clone(&dyn_clock),
        ),
        ModerationHandler::new(
            Arc::clone(&capability) as Arc<dyn Classifier>,
            Arc::clone(&dyn_content),
            event_bus.clone(),
            Arc::clone(&dyn_clock),
        ),
        RecommendationHandler::new(
            capability as Arc<dyn Embedder>,
            Arc::clone(&dyn_content),
            Arc::clone(&dyn_clock),
        ),
        EscrowReleaseHandler::new(escrow.clone()),
    );
    let engine = RetryEngine::new(
        test_policy(),
        Arc::clone(&dyn_queue),
        dyn_dead_letters,
        event_bus.clone(),
        Arc::clone(&dyn_clock),
    );
    let worker = Arc::new(Worker::new(
        dyn_queue,
        engine,
        Arc::new(dispatcher),
        JobRateLimiter::per_second(0),
        escrow.clone(),
        idempotency,
        dyn_content,
        dyn_clock,
        WorkerSettings {
            dequeue_timeout: Duration::from_millis(20),
            ..WorkerSettings::default()
        },
    ));

    let state = AppState {
        escrow: escrow.clone(),
        jobs: jobs.clone(),
        guard,
        event_bus: event_bus.clone(),
        role: AppRole::All,
    };
    let router = api::build_router().with_state(state);

    TestApp {
        router,
        clock,
        queue,
        dead_letters,
        content,
        escrow,
        jobs,
        worker,
        event_bus,
    }
}

/// Lists a material owned by `seller` and returns its ID.
pub async fn list_material(app: &TestApp, seller: UserId, price: i64) -> uuid::Uuid {
    let material_id = uuid::Uuid::new_v4();
    app.escrow
        .upsert_listing(Listing {
            subject: SubjectRef::material(material_id),
            seller_id: seller,
            price: Some(price),
            available: true,
            file_key: Some(format!("materials/{material_id}.pdf")),
        })
        .await
        .unwrap();
    material_id
}

/// Request builder carrying the caller's identity.
pub fn request(method: &str, uri: &str, user: Option<UserId>, admin: bool) -> axum::http::request::Builder {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    if admin {
        builder = builder.header("x-user-role", "admin");
    }
    builder
}

/// Sends `request` and returns status, headers and the JSON body
/// (`null` when the body is empty or not JSON).
pub async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, json)
}

/// Sends a JSON body with an optional idempotency key.
pub async fn send_json(
    app: &TestApp,
    builder: axum::http::request::Builder,
    key: Option<&str>,
    body: Value,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = builder.header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-idempotency-key", key);
    }
    send(app, builder.body(Body::from(body.to_string())).unwrap()).await
}

/// A fresh valid idempotency key.
pub fn new_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Drains the queue through the worker until a dequeue times out.
pub async fn drain(app: &TestApp) -> usize {
    let mut processed = 0;
    while let Some(_outcome) = app.worker.process_next().await.unwrap() {
        processed += 1;
    }
    processed
}
