//! Type-safe identifiers.
//!
//! Every entity identifier is a newtype around [`uuid::Uuid`] (v4) so that a
//! transaction ID can never be passed where a dispute ID is expected.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Creates a new random identifier (UUID v4).
            #[must_use]
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Creates an identifier from an existing [`uuid::Uuid`].
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the inner [`uuid::Uuid`].
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for uuid::Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id! {
    /// Identifier of a platform user (buyer, seller, reporter or admin).
    UserId
}

uuid_id! {
    /// Identifier of a ledger [`super::Transaction`].
    TransactionId
}

uuid_id! {
    /// Identifier of a [`super::Dispute`].
    DisputeId
}

uuid_id! {
    /// Identifier of a queued [`super::Job`]. Distinguishes two jobs with
    /// identical payloads inside the queue.
    JobId
}

uuid_id! {
    /// Identifier of a [`super::DeadLetterEntry`].
    DeadLetterId
}
