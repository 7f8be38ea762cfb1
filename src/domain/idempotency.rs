//! Idempotency keys and the records that deduplicate them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;
use crate::error::GatewayError;

/// Byte offsets of the hyphens in a canonical hyphenated UUID.
const HYPHEN_POSITIONS: [usize; 4] = [8, 13, 18, 23];

/// Client-supplied idempotency key, guaranteed to be a hyphenated UUID v4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(uuid::Uuid);

impl IdempotencyKey {
    /// Validates the raw header value.
    ///
    /// Accepts exactly `xxxxxxxx-xxxx-4xxx-[89ab]xxx-xxxxxxxxxxxx` (hex,
    /// case-insensitive). Braced, URN and simple forms are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidIdempotencyKey`] for anything else.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let bytes = raw.as_bytes();
        if bytes.len() != 36 {
            return Err(GatewayError::InvalidIdempotencyKey);
        }
        let well_formed = bytes.iter().enumerate().all(|(i, b)| {
            if HYPHEN_POSITIONS.contains(&i) {
                *b == b'-'
            } else {
                b.is_ascii_hexdigit()
            }
        });
        if !well_formed {
            return Err(GatewayError::InvalidIdempotencyKey);
        }
        let uuid = uuid::Uuid::parse_str(raw).map_err(|_| GatewayError::InvalidIdempotencyKey)?;
        if uuid.get_version() != Some(uuid::Version::Random)
            || uuid.get_variant() != uuid::Variant::RFC4122
        {
            return Err(GatewayError::InvalidIdempotencyKey);
        }
        Ok(Self(uuid))
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Scopes the key to a caller so two users can never collide.
    #[must_use]
    pub fn scoped(&self, caller: Option<UserId>) -> ScopedKey {
        match caller {
            Some(user) => ScopedKey(format!("idempotency:{user}:{}", self.0)),
            None => ScopedKey(format!("idempotency:anonymous:{}", self.0)),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Storage key `idempotency:{caller}:{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopedKey(String);

impl ScopedKey {
    /// Wraps an already scoped key (as read back from storage).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the guarded operation is still running or has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// The first request with this key is executing.
    Processing,
    /// The response is known and cached.
    Completed,
}

impl IdempotencyStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for IdempotencyStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            other => Err(GatewayError::Internal(format!(
                "unknown idempotency status: {other}"
            ))),
        }
    }
}

/// Response replayed verbatim for duplicate requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// HTTP status code of the original response.
    pub status_code: u16,
    /// JSON body of the original response.
    pub body: serde_json::Value,
}

/// Deduplication record for one scoped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Scoped key.
    pub key: ScopedKey,
    /// Processing or completed.
    pub status: IdempotencyStatus,
    /// Present once completed.
    pub cached_response: Option<CachedResponse>,
    /// First sighting of the key.
    pub created_at: DateTime<Utc>,
    /// After this instant the record is not authoritative.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A fresh `processing` record.
    #[must_use]
    pub fn processing(key: ScopedKey, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            key,
            status: IdempotencyStatus::Processing,
            cached_response: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Finalizes the record with the response. Consumes `self` so a
    /// completed record cannot be moved back to processing.
    #[must_use]
    pub fn complete(self, response: CachedResponse) -> Self {
        Self {
            status: IdempotencyStatus::Completed,
            cached_response: Some(response),
            ..self
        }
    }

    /// Records past their TTL must be treated as absent.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_v4() {
        let key = "3f1c2b8e-7a4d-4c1e-9b2a-5d6e7f8a9b0c";
        let Ok(parsed) = IdempotencyKey::parse(key) else {
            panic!("valid v4 key rejected");
        };
        assert_eq!(parsed.to_string(), key);
        assert!(IdempotencyKey::parse(&key.to_uppercase()).is_ok());
    }

    #[test]
    fn rejects_other_versions_and_forms() {
        // version 1
        assert!(IdempotencyKey::parse("3f1c2b8e-7a4d-1c1e-9b2a-5d6e7f8a9b0c").is_err());
        // wrong variant nibble
        assert!(IdempotencyKey::parse("3f1c2b8e-7a4d-4c1e-7b2a-5d6e7f8a9b0c").is_err());
        // simple and braced forms
        assert!(IdempotencyKey::parse("3f1c2b8e7a4d4c1e9b2a5d6e7f8a9b0c").is_err());
        assert!(IdempotencyKey::parse("{3f1c2b8e-7a4d-4c1e-9b2a-5d6e7f8a9b0c}").is_err());
        assert!(IdempotencyKey::parse("not-a-key").is_err());
        assert!(IdempotencyKey::parse("").is_err());
    }

    #[test]
    fn scoping_separates_callers() {
        let Ok(key) = IdempotencyKey::parse("3f1c2b8e-7a4d-4c1e-9b2a-5d6e7f8a9b0c") else {
            panic!("valid key");
        };
        let a = key.scoped(Some(UserId::new()));
        let b = key.scoped(Some(UserId::new()));
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("idempotency:"));
        assert!(key.scoped(None).as_str().contains("anonymous"));
    }

    #[test]
    fn record_expiry() {
        let now = Utc::now();
        let record = IdempotencyRecord::processing(
            ScopedKey::from_raw("k"),
            now,
            chrono::Duration::hours(24),
        );
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + chrono::Duration::hours(24)));

        let done = record.complete(CachedResponse {
            status_code: 200,
            body: serde_json::json!({"ok": true}),
        });
        assert_eq!(done.status, IdempotencyStatus::Completed);
        assert_eq!(done.created_at, now);
    }
}
