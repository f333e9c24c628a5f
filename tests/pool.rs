// tests/pool.rs

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use amqp_rpc::{
    // ---
    ConnectionPool,
    PoolConfig,
    RpcError,
};

use common::{eventually, fast_retry, init_logging, memory_pool};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checked_out_channels_never_exceed_connections_times_channels() {
    // ---
    init_logging();

    const MAX_CONNECTIONS: usize = 2;
    const MAX_CHANNELS: usize = 3;
    const CALLERS: usize = 40;

    let (_broker, pool) = memory_pool(
        PoolConfig::new("memory://")
            .with_connections(1, MAX_CONNECTIONS)
            .with_channels(1, MAX_CHANNELS),
    )
    .await;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..CALLERS {
        let pool = pool.clone();
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let lease = pool.get_channel().await.expect("acquire failed");
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            assert!(pool.stats().checked_out <= MAX_CONNECTIONS * MAX_CHANNELS);

            tokio::time::sleep(Duration::from_millis(5)).await;

            current.fetch_sub(1, Ordering::SeqCst);
            drop(lease);
        }));
    }

    for task in tasks {
        timeout(Duration::from_secs(10), task)
            .await
            .expect("caller hung")
            .expect("caller panicked");
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= MAX_CONNECTIONS * MAX_CHANNELS, "peak {peak}");
    assert!(pool.stats().connections <= MAX_CONNECTIONS);
    assert_eq!(pool.stats().checked_out, 0);
}

#[tokio::test]
async fn third_caller_waits_for_a_returned_channel() {
    // ---
    init_logging();

    // ---
    // Arrange: one connection, two channels
    // ---
    let (_broker, pool) = memory_pool(
        PoolConfig::new("memory://")
            .with_connections(1, 1)
            .with_channels(1, 2),
    )
    .await;

    let first = pool
        .get_channel_timeout(Duration::from_millis(100))
        .await
        .expect("first caller should not wait");
    let second = pool
        .get_channel_timeout(Duration::from_millis(100))
        .await
        .expect("second caller should not wait");

    let first_id = first.id();

    // ---
    // Act
    // ---
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get_channel().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "third caller must block");

    pool.return_channel(first);

    // ---
    // Assert
    // ---
    let third = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("third caller never woke up")
        .expect("task panicked")
        .expect("acquire failed");

    assert_eq!(third.id(), first_id);
    assert_eq!(pool.stats().connections, 1);
    drop(second);
}

#[tokio::test]
async fn open_channel_is_reused_before_a_new_one_is_created() {
    // ---
    let (_broker, pool) = memory_pool(
        PoolConfig::new("memory://")
            .with_connections(1, 1)
            .with_channels(1, 5),
    )
    .await;

    for _ in 0..3 {
        let lease = pool.get_channel().await.unwrap();
        drop(lease);
    }

    let stats = pool.stats();
    assert_eq!(stats.free, 1, "only the starting channel should exist");
    assert_eq!(stats.checked_out, 0);
}

#[tokio::test]
async fn closed_channel_is_discarded_on_return() {
    // ---
    let (_broker, pool) = memory_pool(
        PoolConfig::new("memory://")
            .with_connections(1, 1)
            .with_channels(1, 1),
    )
    .await;

    let lease = pool.get_channel().await.unwrap();
    let closed_id = lease.id();
    lease.close().await.unwrap();
    drop(lease);

    assert_eq!(pool.stats().free, 0);

    let fresh = pool
        .get_channel_timeout(Duration::from_millis(100))
        .await
        .expect("capacity was not reclaimed");
    assert_ne!(fresh.id(), closed_id);
    assert!(fresh.is_open());
}

#[tokio::test]
async fn invalid_bounds_are_rejected_at_open() {
    // ---
    let broker = amqp_rpc::MemoryBroker::new();

    for config in [
        PoolConfig::new("memory://").with_connections(0, 1),
        PoolConfig::new("memory://").with_connections(3, 2),
        PoolConfig::new("memory://").with_channels(0, 1),
        PoolConfig::new("memory://").with_channels(4, 3),
    ] {
        let result = ConnectionPool::open(config, broker.connector()).await;
        assert!(matches!(result, Err(RpcError::InvalidConfig(_))));
    }
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn dead_connection_is_replaced_on_demand() {
    // ---
    init_logging();

    let (broker, pool) = memory_pool(
        PoolConfig::new("memory://")
            .with_connections(1, 1)
            .with_channels(1, 2),
    )
    .await;

    let before = pool.get_channel().await.unwrap().connection().id();

    broker.close_all_connections().await;
    assert!(eventually(Duration::from_secs(1), || broker.connection_count() == 0).await);

    let lease = pool
        .get_channel_timeout(Duration::from_secs(1))
        .await
        .expect("pool did not reconnect");

    assert_ne!(lease.connection().id(), before);
    assert!(lease.is_open());
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(pool.stats().connections, 1);
}

#[tokio::test]
async fn connect_retry_rides_out_refused_connections() {
    // ---
    let broker = amqp_rpc::MemoryBroker::new();
    broker.fail_next_connects(2);

    let pool = ConnectionPool::open(
        PoolConfig::new("memory://").with_connect_retry(fast_retry()),
        broker.connector(),
    )
    .await
    .expect("retries should outlast two refusals");

    assert_eq!(pool.stats().connections, 1);
}

#[tokio::test]
async fn refused_connection_without_retry_fails() {
    // ---
    let broker = amqp_rpc::MemoryBroker::new();
    broker.fail_next_connects(1);

    let result = ConnectionPool::open(PoolConfig::new("memory://"), broker.connector()).await;
    assert!(matches!(result, Err(RpcError::TransportRetryable(_))));
}

#[tokio::test]
async fn close_wakes_waiting_callers() {
    // ---
    let (_broker, pool) = memory_pool(
        PoolConfig::new("memory://")
            .with_connections(1, 1)
            .with_channels(1, 1),
    )
    .await;

    let _held = pool.get_channel().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get_channel().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.close().await;

    let result = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter not woken")
        .expect("task panicked");
    assert!(matches!(result, Err(RpcError::PoolClosed)));
}
