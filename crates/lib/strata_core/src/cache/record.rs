//! A value with an expiry instant.

use std::time::Duration;

use tokio::time::Instant;

/// A cached value that is only present until `expires_at`.
#[derive(Debug, Clone)]
pub struct CacheRecord<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CacheRecord<T> {
    /// Wrap `value`, expiring `ttl` from now.
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    /// Whether the record is still present at `now`.
    pub fn is_live_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn is_live(&self) -> bool {
        self.is_live_at(Instant::now())
    }

    /// The value if the record has not expired.
    pub fn get(&self) -> Option<&T> {
        self.is_live().then_some(&self.value)
    }

    /// The value regardless of expiry.
    pub fn stale(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}
