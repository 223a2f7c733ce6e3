//! Bounded per-provider connection pools
//!
//! Each provider gets its own pool of slots. New slots are minted by forking
//! the pool's template (its first slot), so a pool must be seeded with one
//! connected handle before it can grow.

pub mod connection_pool;

pub use connection_pool::ConnectionPool;

use crate::provider::ProviderHandle;
use std::time::Duration;
use tokio::time::Instant;

/// Per-provider pool policy
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    /// Free slots idle longer than this are reaped
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 5,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// One pooled session and its bookkeeping
#[derive(Debug, Clone)]
pub struct ConnectionSlot {
    pub handle: ProviderHandle,
    pub in_use: bool,
    pub last_used_at: Instant,
}

impl ConnectionSlot {
    fn new(handle: ProviderHandle, in_use: bool) -> Self {
        Self {
            handle,
            in_use,
            last_used_at: Instant::now(),
        }
    }

    fn is_idle_past(&self, timeout: Duration) -> bool {
        !self.in_use && self.last_used_at.elapsed() > timeout
    }
}

/// Point-in-time view of one provider's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots currently in the pool
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    /// Slots reserved by acquires still connecting
    pub pending: usize,
    pub max_size: usize,
}

impl PoolStats {
    /// Share of capacity occupied, as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_size as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_pool_size, 5);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_utilization() {
        let stats = PoolStats {
            total: 3,
            in_use: 2,
            idle: 1,
            pending: 0,
            max_size: 4,
        };
        assert_eq!(stats.utilization(), 75.0);

        let empty = PoolStats {
            max_size: 0,
            ..stats
        };
        assert_eq!(empty.utilization(), 0.0);
    }
}
