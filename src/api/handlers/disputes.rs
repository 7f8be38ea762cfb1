//! Buyer-facing dispute endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{CreateDisputeRequest, ListResponse};
use crate::api::extract::AuthUser;
use crate::app_state::AppState;
use crate::domain::{Dispute, NewDispute};
use crate::error::{ErrorResponse, GatewayError};

/// `POST /disputes`: File a dispute against an escrowed transaction.
///
/// # Errors
///
/// Returns [`GatewayError::TransactionNotEligible`] outside the escrow
/// window or for non-buyers, and [`GatewayError::DisputeAlreadyExists`]
/// when one is already open.
#[utoipa::path(
    post,
    path = "/disputes",
    tag = "Disputes",
    summary = "File a dispute",
    description = "Blocks escrow release for the transaction until an administrator resolves the dispute.",
    request_body = CreateDisputeRequest,
    params(("x-user-id" = uuid::Uuid, Header, description = "Authenticated user")),
    responses(
        (status = 200, description = "Dispute filed", body = Dispute),
        (status = 400, description = "Transaction not eligible", body = ErrorResponse),
        (status = 404, description = "Transaction not found", body = ErrorResponse),
        (status = 409, description = "A dispute is already open", body = ErrorResponse),
    )
)]
pub async fn create_dispute(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateDisputeRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let dispute = state
        .escrow
        .file_dispute(NewDispute {
            transaction_id: req.transaction_id.into(),
            reporter_id: user.user_id,
            reason: req.reason,
            evidence_url: req.evidence_url,
        })
        .await?;
    Ok((StatusCode::OK, Json(dispute)))
}

/// `GET /disputes/mine`: Disputes filed by the caller.
///
/// # Errors
///
/// Returns [`GatewayError`] on storage failure.
#[utoipa::path(
    get,
    path = "/disputes/mine",
    tag = "Disputes",
    summary = "List my disputes",
    description = "Returns the caller's disputes, newest first.",
    params(("x-user-id" = uuid::Uuid, Header, description = "Authenticated user")),
    responses(
        (status = 200, description = "Caller's disputes", body = ListResponse<Dispute>),
        (status = 401, description = "Unauthenticated", body = ErrorResponse),
    )
)]
pub async fn my_disputes(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, GatewayError> {
    let disputes = state.escrow.disputes_by_reporter(user.user_id).await?;
    Ok(Json(ListResponse::new(disputes)))
}

/// Dispute routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/disputes", post(create_dispute))
        .route("/disputes/mine", get(my_disputes))
}
