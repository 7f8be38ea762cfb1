//! Gateway error types with HTTP status code mapping.
//!
//! [`GatewayError`] is the central error type for the service. Each variant
//! maps to an HTTP status code and a stable string code that clients
//! program against. The same enum travels through the worker path, where
//! [`GatewayError::is_retryable`] decides between backoff and discard.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": "IDEMPOTENCY_CONFLICT",
///     "message": "request with this idempotency key is still being processed"
///   }
/// }
/// ```
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with a string code and human-readable message.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable error message. Generic for server-side failures.
    pub message: String,
    /// Optional additional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Status mapping
///
/// | Category                       | HTTP Status             |
/// |--------------------------------|-------------------------|
/// | Validation / idempotency key   | 400 Bad Request         |
/// | Authentication                 | 401 / 403               |
/// | Missing entities               | 404 Not Found           |
/// | State-machine / in-flight      | 409 Conflict            |
/// | External capability failures   | 502 / 504               |
/// | Storage, queue, internal       | 500                     |
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A guarded endpoint was called without `x-idempotency-key`.
    #[error("x-idempotency-key header is required for this endpoint")]
    MissingIdempotencyKey,

    /// The idempotency key is not a UUID v4.
    #[error("invalid idempotency key format, must be a UUID v4")]
    InvalidIdempotencyKey,

    /// A request with the same idempotency key is still executing.
    #[error("request with this idempotency key is still being processed")]
    IdempotencyConflict,

    /// No authenticated caller.
    #[error("authentication required")]
    Unauthorized,

    /// Caller is authenticated but lacks the required role.
    #[error("insufficient permissions")]
    Forbidden,

    /// Transaction with the given ID was not found.
    #[error("transaction not found: {0}")]
    TransactionNotFound(uuid::Uuid),

    /// Dispute with the given ID was not found.
    #[error("dispute not found: {0}")]
    DisputeNotFound(uuid::Uuid),

    /// Purchasable subject (material, stream, ticket) was not found.
    #[error("subject not found: {0}")]
    SubjectNotFound(String),

    /// Dead letter entry with the given ID was not found.
    #[error("dead letter entry not found: {0}")]
    DeadLetterNotFound(uuid::Uuid),

    /// Buyer's available balance does not cover the amount.
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount the operation needs.
        required: i64,
        /// Available balance at the time of the check.
        available: i64,
    },

    /// Subject exists but cannot currently be bought.
    #[error("subject unavailable: {0}")]
    SubjectUnavailable(String),

    /// Transaction is not in a state that allows the requested action.
    #[error("transaction not eligible: {0}")]
    TransactionNotEligible(String),

    /// An open dispute already exists for the transaction.
    #[error("an open dispute already exists for transaction {0}")]
    DisputeAlreadyExists(uuid::Uuid),

    /// The dispute has already been resolved.
    #[error("dispute {0} is not open")]
    DisputeNotOpen(uuid::Uuid),

    /// Escrow release refused because a dispute is open.
    #[error("escrow release blocked by open dispute on transaction {0}")]
    ActiveDisputeBlocksRelease(uuid::Uuid),

    /// A ledger procedure failed to commit.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// An external capability (classifier, extractor, embedder) failed.
    #[error("external service error (status {status:?}): {message}")]
    ExternalService {
        /// HTTP status returned by the service, `None` for transport errors.
        status: Option<u16>,
        /// Error description.
        message: String,
    },

    /// An external call exceeded its request timeout.
    #[error("external call timed out: {0}")]
    ExternalTimeout(String),

    /// An external capability answered with something we cannot use.
    #[error("malformed external response: {0}")]
    MalformedExternalResponse(String),

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Job queue failure.
    #[error("queue error: {0}")]
    QueueError(String),

    /// Caller or downstream exceeded a rate limit.
    #[error("rate limit exceeded; retry after {retry_after_ms} ms")]
    RateLimited {
        /// Milliseconds until the caller may retry.
        retry_after_ms: u64,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the stable string code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "VALIDATION_ERROR",
            Self::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            Self::InvalidIdempotencyKey => "INVALID_IDEMPOTENCY_KEY",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::Unauthorized => "AUTH_UNAUTHORIZED",
            Self::Forbidden => "AUTH_FORBIDDEN",
            Self::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            Self::DisputeNotFound(_) => "DISPUTE_NOT_FOUND",
            Self::SubjectNotFound(_) => "SUBJECT_NOT_FOUND",
            Self::DeadLetterNotFound(_) => "DEAD_LETTER_NOT_FOUND",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::SubjectUnavailable(_) => "SUBJECT_UNAVAILABLE",
            Self::TransactionNotEligible(_) => "TRANSACTION_NOT_ELIGIBLE",
            Self::DisputeAlreadyExists(_) => "DISPUTE_ALREADY_EXISTS",
            Self::DisputeNotOpen(_) => "DISPUTE_NOT_OPEN",
            Self::ActiveDisputeBlocksRelease(_) => "ACTIVE_DISPUTE_BLOCKS_RELEASE",
            Self::TransactionFailed(_) => "TRANSACTION_FAILED",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::ExternalTimeout(_) => "EXTERNAL_TIMEOUT",
            Self::MalformedExternalResponse(_) => "MALFORMED_EXTERNAL_RESPONSE",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::QueueError(_) => "QUEUE_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::MissingIdempotencyKey
            | Self::InvalidIdempotencyKey
            | Self::InsufficientFunds { .. }
            | Self::TransactionNotEligible(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::TransactionNotFound(_)
            | Self::DisputeNotFound(_)
            | Self::SubjectNotFound(_)
            | Self::DeadLetterNotFound(_) => StatusCode::NOT_FOUND,
            Self::IdempotencyConflict
            | Self::SubjectUnavailable(_)
            | Self::DisputeAlreadyExists(_)
            | Self::DisputeNotOpen(_)
            | Self::ActiveDisputeBlocksRelease(_) => StatusCode::CONFLICT,
            Self::ExternalService { .. } | Self::MalformedExternalResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::ExternalTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::TransactionFailed(_)
            | Self::PersistenceError(_)
            | Self::QueueError(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the failed operation later can succeed.
    ///
    /// Rate limits, 5xx/429 answers, transport failures, timeouts and
    /// storage hiccups are transient. Validation, missing entities and
    /// state-machine violations are not: retrying cannot change them.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ExternalService { status, .. } => match status {
                None => true,
                // 501 means the capability does not exist at all
                Some(code) => *code == 429 || (*code >= 500 && *code != 501),
            },
            Self::ExternalTimeout(_)
            | Self::PersistenceError(_)
            | Self::QueueError(_)
            | Self::TransactionFailed(_)
            | Self::RateLimited { .. } => true,
            _ => false,
        }
    }

    /// Message exposed to clients. Server-side failures get a generic text.
    fn public_message(&self) -> String {
        if self.status_code().is_server_error() {
            "system busy, please try again later".to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::QueueError(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.error_code(), error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code().to_string(),
                message: self.public_message(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_errors_map_to_contract_codes() {
        assert_eq!(
            GatewayError::IdempotencyConflict.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            GatewayError::IdempotencyConflict.error_code(),
            "IDEMPOTENCY_CONFLICT"
        );
        assert_eq!(
            GatewayError::InvalidIdempotencyKey.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::InvalidIdempotencyKey.error_code(),
            "INVALID_IDEMPOTENCY_KEY"
        );
    }

    #[test]
    fn external_errors_classified_by_status() {
        let transport = GatewayError::ExternalService {
            status: None,
            message: "connection reset".to_string(),
        };
        let throttled = GatewayError::ExternalService {
            status: Some(429),
            message: "quota".to_string(),
        };
        let unavailable = GatewayError::ExternalService {
            status: Some(503),
            message: "down".to_string(),
        };
        let rejected = GatewayError::ExternalService {
            status: Some(400),
            message: "bad image".to_string(),
        };
        assert!(transport.is_retryable());
        assert!(throttled.is_retryable());
        assert!(unavailable.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(
            !GatewayError::ExternalService {
                status: Some(501),
                message: "missing".to_string(),
            }
            .is_retryable()
        );
        assert!(GatewayError::ExternalTimeout("ocr".to_string()).is_retryable());
    }

    #[test]
    fn business_errors_are_not_retryable() {
        assert!(!GatewayError::InvalidRequest("x".to_string()).is_retryable());
        assert!(!GatewayError::TransactionNotFound(uuid::Uuid::new_v4()).is_retryable());
        assert!(!GatewayError::ActiveDisputeBlocksRelease(uuid::Uuid::new_v4()).is_retryable());
        assert!(!GatewayError::MalformedExternalResponse("x".to_string()).is_retryable());
    }

    #[test]
    fn server_errors_hide_details() {
        let err = GatewayError::PersistenceError("relation wallets does not exist".to_string());
        assert!(!err.public_message().contains("wallets"));

        let err = GatewayError::SubjectUnavailable("material sold out".to_string());
        assert!(err.public_message().contains("sold out"));
    }
}
