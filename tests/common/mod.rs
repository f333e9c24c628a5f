// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use amqp_rpc::{ConnectionPool, MemoryBroker, PoolConfig, RetryConfig};

/// Pool on a fresh memory broker, sized for concurrent tests.
pub async fn memory_pool(config: PoolConfig) -> (Arc<MemoryBroker>, ConnectionPool) {
    // ---
    let broker = MemoryBroker::new();
    let pool = ConnectionPool::open(config, broker.connector())
        .await
        .expect("failed to open pool");
    (broker, pool)
}

pub fn roomy_pool_config() -> PoolConfig {
    PoolConfig::new("memory://")
        .with_connections(1, 2)
        .with_channels(2, 16)
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        multiplier: 2.0,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    // ---
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;
    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
