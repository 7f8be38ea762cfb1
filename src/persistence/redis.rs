//! Lazily connected, process-wide Redis handle.

use std::fmt;

use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use crate::error::GatewayError;

/// Shared Redis client that connects on first use.
///
/// Concurrent first callers share a single connection attempt; a failed
/// attempt leaves the cell empty so the next caller retries.
pub struct RedisHandle {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisHandle")
            .field("connected", &self.manager.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisHandle {
    /// Parses the URL without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if the URL is invalid.
    pub fn open(url: &str) -> Result<Self, GatewayError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
        })
    }

    /// Returns a multiplexed connection, connecting on first call.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::QueueError`] if Redis is unreachable.
    pub async fn connection(&self) -> Result<ConnectionManager, GatewayError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                tracing::info!("redis connection established");
                Ok::<_, GatewayError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_does_not_connect() {
        let handle = RedisHandle::open("redis://127.0.0.1:1/");
        assert!(handle.is_ok());
        assert!(format!("{handle:?}").contains("connected: false"));
    }

    #[test]
    fn invalid_url_rejected() {
        assert!(matches!(
            RedisHandle::open("not a url"),
            Err(GatewayError::QueueError(_))
        ));
    }
}
