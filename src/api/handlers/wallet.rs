//! Wallet endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::DepositRequest;
use crate::api::extract::{AuthUser, IdempotencyHeader};
use crate::app_state::AppState;
use crate::domain::Wallet;
use crate::error::{ErrorResponse, GatewayError};
use crate::idempotency::GuardedResponse;

/// `POST /wallet/deposit`: Credit the caller's available balance.
///
/// # Errors
///
/// Returns [`GatewayError`] for missing or invalid keys, in-flight
/// duplicates and non-positive amounts.
#[utoipa::path(
    post,
    path = "/wallet/deposit",
    tag = "Wallet",
    summary = "Deposit funds",
    description = "Credits the available balance. Requires `x-idempotency-key`.",
    request_body = DepositRequest,
    params(
        ("x-idempotency-key" = String, Header, description = "UUID v4 idempotency key"),
        ("x-user-id" = uuid::Uuid, Header, description = "Authenticated user"),
    ),
    responses(
        (status = 200, description = "Updated balances", body = Wallet),
        (status = 400, description = "Invalid amount or key", body = ErrorResponse),
        (status = 409, description = "Same-key request in flight", body = ErrorResponse),
    )
)]
pub async fn deposit(
    State(state): State<AppState>,
    user: AuthUser,
    IdempotencyHeader(key): IdempotencyHeader,
    Json(req): Json<DepositRequest>,
) -> Result<GuardedResponse, GatewayError> {
    let scoped = key.scoped(Some(user.user_id));
    let escrow = state.escrow;
    state
        .guard
        .execute(&scoped, || async move {
            let wallet = escrow.deposit(user.user_id, req.amount).await?;
            Ok((StatusCode::OK, wallet))
        })
        .await
}

/// `GET /wallet`: Current balances.
///
/// # Errors
///
/// Returns [`GatewayError`] on storage failure.
#[utoipa::path(
    get,
    path = "/wallet",
    tag = "Wallet",
    summary = "Get balances",
    description = "Returns the caller's available and escrow balances.",
    params(("x-user-id" = uuid::Uuid, Header, description = "Authenticated user")),
    responses(
        (status = 200, description = "Balances", body = Wallet),
        (status = 401, description = "Unauthenticated", body = ErrorResponse),
    )
)]
pub async fn get_wallet(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(state.escrow.wallet(user.user_id).await?))
}

/// Wallet routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/wallet", get(get_wallet))
        .route("/wallet/deposit", post(deposit))
}
