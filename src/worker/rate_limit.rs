//! Global job rate limit shared by all consumer tasks.

use std::fmt;
use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Token bucket admitting at most `per_second` jobs per second.
///
/// A rate of zero disables limiting.
pub struct JobRateLimiter {
    limiter: Option<DefaultDirectRateLimiter>,
    per_second: u32,
}

impl fmt::Debug for JobRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRateLimiter")
            .field("per_second", &self.per_second)
            .finish_non_exhaustive()
    }
}

impl JobRateLimiter {
    /// Creates a limiter with a burst equal to one second's quota.
    #[must_use]
    pub fn per_second(per_second: u32) -> Self {
        let limiter = NonZeroU32::new(per_second).map(|n| RateLimiter::direct(Quota::per_second(n)));
        Self {
            limiter,
            per_second,
        }
    }

    /// Configured rate; `0` when unlimited.
    #[must_use]
    pub const fn rate(&self) -> u32 {
        self.per_second
    }

    /// Waits until a job may start.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Takes a permit if one is available right now.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.limiter.as_ref().is_none_or(|l| l.check().is_ok())
    }
}
