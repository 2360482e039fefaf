//! Connection Limiting
//!
//! Enforces maximum concurrent connections to prevent resource exhaustion.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Connection limiter handing out RAII slots.
#[derive(Clone)]
pub struct ConnectionLimiter {
    slots: Arc<Semaphore>,
    max_connections: usize,
}

/// A held connection slot; released when dropped.
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLimiter {
    /// Creates a new connection limiter with the given maximum.
    pub fn new(max_connections: usize) -> Self {
        ConnectionLimiter {
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Tries to acquire a connection slot.
    ///
    /// Returns `Some(ConnectionGuard)` if successful, `None` if at capacity.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        self.slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ConnectionGuard { _permit: permit })
    }

    /// Returns the current number of active connections.
    pub fn active_count(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    /// Returns the maximum allowed connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_under_limit() {
        let limiter = ConnectionLimiter::new(3);

        let _g1 = limiter.try_acquire().expect("Should allow first");
        let _g2 = limiter.try_acquire().expect("Should allow second");
        let _g3 = limiter.try_acquire().expect("Should allow third");

        assert_eq!(limiter.active_count(), 3);
    }

    #[test]
    fn test_rejects_at_limit() {
        let limiter = ConnectionLimiter::new(2);

        let _g1 = limiter.try_acquire().expect("Should allow first");
        let _g2 = limiter.try_acquire().expect("Should allow second");

        assert!(limiter.try_acquire().is_none(), "Should reject at limit");
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let limiter = ConnectionLimiter::new(1);

        {
            let _guard = limiter.try_acquire().expect("Should allow");
            assert_eq!(limiter.active_count(), 1);
        }

        assert_eq!(limiter.active_count(), 0);
        let _guard = limiter.try_acquire().expect("Should allow after release");
    }

    #[test]
    fn test_zero_max_connections() {
        let limiter = ConnectionLimiter::new(0);
        assert!(
            limiter.try_acquire().is_none(),
            "Zero limit should reject all"
        );
    }

    #[test]
    fn test_guard_is_send() {
        // The guard crosses into spawned connection tasks.
        fn assert_send<T: Send>() {}
        assert_send::<ConnectionGuard>();
    }
}
