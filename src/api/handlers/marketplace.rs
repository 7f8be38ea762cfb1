//! Money-moving purchase endpoints. All three run behind the idempotency
//! guard and share one escrowed purchase path.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use crate::api::dto::{DonationRequest, PurchaseRequest, PurchaseResponse, TicketRequest};
use crate::api::extract::{AuthUser, IdempotencyHeader};
use crate::app_state::AppState;
use crate::domain::SubjectRef;
use crate::error::{ErrorResponse, GatewayError};
use crate::idempotency::GuardedResponse;

async fn guarded_purchase(
    state: AppState,
    user: AuthUser,
    key: IdempotencyHeader,
    subject: SubjectRef,
    amount: Option<i64>,
) -> Result<GuardedResponse, GatewayError> {
    let IdempotencyHeader(key) = key;
    let scoped = key.scoped(Some(user.user_id));
    let escrow = state.escrow;
    state
        .guard
        .execute(&scoped, || async move {
            let record = escrow
                .initiate_purchase(user.user_id, subject, amount, Some(key.to_string()))
                .await?;
            Ok((StatusCode::OK, PurchaseResponse::from_record(record, &escrow)))
        })
        .await
}

/// `POST /marketplace/purchase`: Buy a material into escrow.
///
/// # Errors
///
/// Returns [`GatewayError`] for missing or invalid keys, in-flight
/// duplicates, unknown or unavailable materials and insufficient funds.
#[utoipa::path(
    post,
    path = "/marketplace/purchase",
    tag = "Marketplace",
    summary = "Purchase a material",
    description = "Debits the buyer and holds the seller's net amount in escrow. Requires `x-idempotency-key`; a repeated key replays the original response.",
    request_body = PurchaseRequest,
    params(
        ("x-idempotency-key" = String, Header, description = "UUID v4 idempotency key"),
        ("x-user-id" = uuid::Uuid, Header, description = "Authenticated user"),
    ),
    responses(
        (status = 200, description = "Purchase escrowed", body = PurchaseResponse),
        (status = 400, description = "Missing/invalid key or insufficient funds", body = ErrorResponse),
        (status = 401, description = "Unauthenticated", body = ErrorResponse),
        (status = 404, description = "Material not found", body = ErrorResponse),
        (status = 409, description = "Same-key request in flight", body = ErrorResponse),
    )
)]
pub async fn purchase_material(
    State(state): State<AppState>,
    user: AuthUser,
    key: IdempotencyHeader,
    Json(req): Json<PurchaseRequest>,
) -> Result<GuardedResponse, GatewayError> {
    guarded_purchase(state, user, key, SubjectRef::material(req.material_id), None).await
}

/// `POST /streams/donate`: Donate to a live stream.
///
/// # Errors
///
/// Same as [`purchase_material`], plus a validation error for a
/// non-positive amount.
#[utoipa::path(
    post,
    path = "/streams/donate",
    tag = "Marketplace",
    summary = "Donate to a stream",
    description = "Escrows a client-chosen donation to the streamer. Requires `x-idempotency-key`.",
    request_body = DonationRequest,
    params(
        ("x-idempotency-key" = String, Header, description = "UUID v4 idempotency key"),
        ("x-user-id" = uuid::Uuid, Header, description = "Authenticated user"),
    ),
    responses(
        (status = 200, description = "Donation escrowed", body = PurchaseResponse),
        (status = 400, description = "Invalid amount, key or insufficient funds", body = ErrorResponse),
        (status = 404, description = "Stream not found", body = ErrorResponse),
        (status = 409, description = "Same-key request in flight", body = ErrorResponse),
    )
)]
pub async fn donate(
    State(state): State<AppState>,
    user: AuthUser,
    key: IdempotencyHeader,
    Json(req): Json<DonationRequest>,
) -> Result<GuardedResponse, GatewayError> {
    if req.amount <= 0 {
        return Err(GatewayError::InvalidRequest(
            "donation amount must be positive".to_string(),
        ));
    }
    guarded_purchase(
        state,
        user,
        key,
        SubjectRef::stream(req.stream_id),
        Some(req.amount),
    )
    .await
}

/// `POST /events/tickets`: Buy an event ticket.
///
/// # Errors
///
/// Same as [`purchase_material`].
#[utoipa::path(
    post,
    path = "/events/tickets",
    tag = "Marketplace",
    summary = "Buy an event ticket",
    description = "Escrows the ticket price for the organiser. Requires `x-idempotency-key`.",
    request_body = TicketRequest,
    params(
        ("x-idempotency-key" = String, Header, description = "UUID v4 idempotency key"),
        ("x-user-id" = uuid::Uuid, Header, description = "Authenticated user"),
    ),
    responses(
        (status = 200, description = "Ticket escrowed", body = PurchaseResponse),
        (status = 400, description = "Invalid key or insufficient funds", body = ErrorResponse),
        (status = 404, description = "Event not found", body = ErrorResponse),
        (status = 409, description = "Sold out or same-key request in flight", body = ErrorResponse),
    )
)]
pub async fn buy_ticket(
    State(state): State<AppState>,
    user: AuthUser,
    key: IdempotencyHeader,
    Json(req): Json<TicketRequest>,
) -> Result<GuardedResponse, GatewayError> {
    guarded_purchase(state, user, key, SubjectRef::ticket(req.event_id), None).await
}

/// Marketplace routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/marketplace/purchase", post(purchase_material))
        .route("/streams/donate", post(donate))
        .route("/events/tickets", post(buy_ticket))
}
