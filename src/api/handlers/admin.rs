//! Administrator endpoints: dispute triage and resolution, listing sync,
//! job submission and Dead Letter administration.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};

use crate::api::dto::{
    DeadLetterQuery, DisputeResolutionResponse, LimitParams, ListResponse, ResolveDisputeRequest,
};
use crate::api::extract::AdminUser;
use crate::app_state::AppState;
use crate::domain::{DeadLetterEntry, Dispute, DisputeId, Job, JobPayload, Listing};
use crate::error::{ErrorResponse, GatewayError};

/// `PUT /admin/resolve-dispute/{id}`: Refund the buyer or reject the claim.
///
/// # Errors
///
/// Returns [`GatewayError::DisputeNotFound`], [`GatewayError::DisputeNotOpen`]
/// or [`GatewayError::TransactionNotEligible`].
#[utoipa::path(
    put,
    path = "/admin/resolve-dispute/{id}",
    tag = "Admin",
    summary = "Resolve a dispute",
    description = "`resolved_refund` returns the gross amount to the buyer atomically; `resolved_reject` lets escrow release proceed.",
    request_body = ResolveDisputeRequest,
    params(
        ("id" = uuid::Uuid, Path, description = "Dispute UUID"),
        ("x-user-role" = String, Header, description = "Must be `admin`"),
    ),
    responses(
        (status = 200, description = "Dispute resolved", body = DisputeResolutionResponse),
        (status = 403, description = "Not an administrator", body = ErrorResponse),
        (status = 404, description = "Dispute not found", body = ErrorResponse),
        (status = 409, description = "Dispute already resolved", body = ErrorResponse),
    )
)]
pub async fn resolve_dispute(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<uuid::Uuid>,
    Json(req): Json<ResolveDisputeRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let resolution = state
        .escrow
        .resolve_dispute(DisputeId::from(id), req.status, admin.user_id)
        .await?;
    Ok(Json(DisputeResolutionResponse {
        dispute: resolution.dispute,
        transaction: resolution.transaction,
    }))
}

/// `GET /admin/disputes`: Pending and investigating disputes.
///
/// # Errors
///
/// Returns [`GatewayError`] on storage failure.
#[utoipa::path(
    get,
    path = "/admin/disputes",
    tag = "Admin",
    summary = "List open disputes",
    description = "Returns pending and investigating disputes, oldest first.",
    params(LimitParams),
    responses(
        (status = 200, description = "Open disputes", body = ListResponse<Dispute>),
        (status = 403, description = "Not an administrator", body = ErrorResponse),
    )
)]
pub async fn open_disputes(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, GatewayError> {
    let disputes = state.escrow.open_disputes(params.clamped()).await?;
    Ok(Json(ListResponse::new(disputes)))
}

/// `PUT /admin/disputes/{id}/investigate`: Start reviewing a dispute.
///
/// # Errors
///
/// Returns [`GatewayError::DisputeNotOpen`] unless the dispute is pending.
#[utoipa::path(
    put,
    path = "/admin/disputes/{id}/investigate",
    tag = "Admin",
    summary = "Mark a dispute as investigating",
    params(("id" = uuid::Uuid, Path, description = "Dispute UUID")),
    responses(
        (status = 200, description = "Dispute under investigation", body = Dispute),
        (status = 404, description = "Dispute not found", body = ErrorResponse),
        (status = 409, description = "Dispute is not pending", body = ErrorResponse),
    )
)]
pub async fn investigate_dispute(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<uuid::Uuid>,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(state.escrow.mark_investigating(DisputeId::from(id)).await?))
}

/// `PUT /admin/listings`: Mirror a listing's price and seller into the ledger.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for non-positive prices.
#[utoipa::path(
    put,
    path = "/admin/listings",
    tag = "Admin",
    summary = "Create or update a listing",
    request_body = Listing,
    responses(
        (status = 200, description = "Listing stored", body = Listing),
        (status = 400, description = "Invalid price", body = ErrorResponse),
    )
)]
pub async fn upsert_listing(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(listing): Json<Listing>,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(state.escrow.upsert_listing(listing).await?))
}

/// `POST /admin/jobs`: Enqueue a job on any topic.
///
/// # Errors
///
/// Returns [`GatewayError::QueueError`] if the queue is unreachable.
#[utoipa::path(
    post,
    path = "/admin/jobs",
    tag = "Admin",
    summary = "Submit a job",
    description = "Body is a topic-tagged payload: `{\"topic\": \"moderation\", \"payload\": {...}}`.",
    request_body = JobPayload,
    responses(
        (status = 202, description = "Job queued", body = Job),
        (status = 400, description = "Malformed payload", body = ErrorResponse),
    )
)]
pub async fn submit_job(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(task): Json<JobPayload>,
) -> Result<impl IntoResponse, GatewayError> {
    let job = state.jobs.submit(task).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// `GET /admin/dead-letters`: Inspect permanently failed jobs.
///
/// # Errors
///
/// Returns [`GatewayError`] on storage failure.
#[utoipa::path(
    get,
    path = "/admin/dead-letters",
    tag = "Admin",
    summary = "List dead letters",
    params(DeadLetterQuery),
    responses(
        (status = 200, description = "Dead letters, newest first", body = ListResponse<DeadLetterEntry>),
    )
)]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<DeadLetterQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let limit = LimitParams {
        limit: query.limit.unwrap_or(50),
    }
    .clamped();
    let entries = state.jobs.dead_letters(query.topic, limit).await?;
    Ok(Json(ListResponse::new(entries)))
}

/// `POST /admin/dead-letters/{id}/retry`: Re-enqueue with a fresh budget.
///
/// # Errors
///
/// Returns [`GatewayError::DeadLetterNotFound`] or
/// [`GatewayError::InvalidRequest`] for entries that cannot be decoded.
#[utoipa::path(
    post,
    path = "/admin/dead-letters/{id}/retry",
    tag = "Admin",
    summary = "Retry a dead letter",
    params(("id" = uuid::Uuid, Path, description = "Dead letter UUID")),
    responses(
        (status = 202, description = "Job re-queued", body = Job),
        (status = 400, description = "Payload cannot be replayed", body = ErrorResponse),
        (status = 404, description = "Entry not found", body = ErrorResponse),
    )
)]
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<uuid::Uuid>,
) -> Result<impl IntoResponse, GatewayError> {
    let job = state.jobs.retry_dead_letter(id.into()).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// `DELETE /admin/dead-letters/{id}`: Discard a dead letter.
///
/// # Errors
///
/// Returns [`GatewayError::DeadLetterNotFound`] if absent.
#[utoipa::path(
    delete,
    path = "/admin/dead-letters/{id}",
    tag = "Admin",
    summary = "Discard a dead letter",
    params(("id" = uuid::Uuid, Path, description = "Dead letter UUID")),
    responses(
        (status = 204, description = "Entry discarded"),
        (status = 404, description = "Entry not found", body = ErrorResponse),
    )
)]
pub async fn discard_dead_letter(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<uuid::Uuid>,
) -> Result<impl IntoResponse, GatewayError> {
    state.jobs.discard_dead_letter(id.into()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Admin routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/resolve-dispute/{id}", put(resolve_dispute))
        .route("/admin/disputes", get(open_disputes))
        .route("/admin/disputes/{id}/investigate", put(investigate_dispute))
        .route("/admin/listings", put(upsert_listing))
        .route("/admin/jobs", post(submit_job))
        .route("/admin/dead-letters", get(list_dead_letters))
        .route("/admin/dead-letters/{id}/retry", post(retry_dead_letter))
        .route("/admin/dead-letters/{id}", delete(discard_dead_letter))
}
