//! Request extractors for the identity headers set by the upstream auth
//! layer and for the idempotency key.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::domain::{IdempotencyKey, UserId};
use crate::error::GatewayError;

/// Header carrying the authenticated user's UUID.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the authenticated user's role.
pub const USER_ROLE_HEADER: &str = "x-user-role";
/// Header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Role asserted by the auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Regular user.
    User,
    /// Administrator.
    Admin,
}

/// Authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    /// Caller identity.
    pub user_id: UserId,
    /// Caller role.
    pub role: Role,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, USER_ID_HEADER)
            .and_then(|raw| uuid::Uuid::parse_str(raw.trim()).ok())
            .map(UserId::from)
            .ok_or(GatewayError::Unauthorized)?;
        let role = match header(parts, USER_ROLE_HEADER).map(str::trim) {
            Some(r) if r.eq_ignore_ascii_case("admin") => Role::Admin,
            _ => Role::User,
        };
        Ok(Self { user_id, role })
    }
}

/// Authenticated administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminUser(pub AuthUser);

impl<S: Send + Sync> FromRequestParts<S> for AdminUser {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if user.role != Role::Admin {
            return Err(GatewayError::Forbidden);
        }
        Ok(Self(user))
    }
}

/// Validated `x-idempotency-key` header. Required on guarded endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyHeader(pub IdempotencyKey);

impl<S: Send + Sync> FromRequestParts<S> for IdempotencyHeader {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .ok_or(GatewayError::MissingIdempotencyKey)?
            .to_str()
            .map_err(|_| GatewayError::InvalidIdempotencyKey)?;
        Ok(Self(IdempotencyKey::parse(raw.trim())?))
    }
}
