use crate::{ms, session_manager, test_config};
use sluice::{
    Driver, IsolationLevel, PoolConfig, SessionError, future::FutureExt,
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::{
    sync::Barrier,
    time::{Instant, sleep},
};

pub async fn pool_bound<D: Driver + Clone>(driver: &D, url: &str) {
    let config = test_config(url).with_pool(
        PoolConfig::default()
            .with_max_size(3)
            .with_max_overflow(2),
    );
    let manager = session_manager(driver, config).await;
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tasks = (0..20)
        .map(|_| {
            let manager = manager.clone();
            let current = current.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                manager
                    .with_session(IsolationLevel::ReadCommitted, move |_| {
                        let current = current.clone();
                        let peak = peak.clone();
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            sleep(ms(5)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                        .boxed()
                    })
                    .await
            })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await
            .expect("The session task panicked")
            .expect("The session failed");
    }
    let stats = manager.pool_stats();
    assert!(peak.load(Ordering::SeqCst) <= 5);
    assert!(stats.peak_checked_out <= 5);
    assert!(stats.peak_checked_out >= 1);
    assert_eq!(stats.checked_out, 0);
    assert!(stats.size <= 3, "overflow connections must be closed: {:?}", stats);
    assert_eq!(stats.idle, stats.size);
    assert_eq!(stats.timeouts, 0);
}

pub async fn acquire_deadline<D: Driver + Clone>(driver: &D, url: &str) {
    let config = test_config(url).with_pool(PoolConfig::default().with_max_size(1));
    let manager = session_manager(driver, config).await;
    let mut held = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");

    let start = Instant::now();
    let result = manager.pool().acquire(ms(100)).await;
    let elapsed = start.elapsed();
    assert!(
        matches!(result, Err(SessionError::PoolTimeout(timeout)) if timeout == ms(100)),
        "Expected a pool timeout, got {:?}",
        result
    );
    assert!(elapsed >= ms(100));
    assert!(elapsed < ms(600), "The timeout took {:?}", elapsed);
    assert_eq!(manager.pool_stats().timeouts, 1);

    held.rollback().await.expect("Could not roll back");
    let connection = manager
        .pool()
        .acquire(ms(100))
        .await
        .expect("The released connection should be available");
    connection.release().await;
    assert_eq!(manager.pool_stats().checked_out, 0);
    assert_eq!(manager.pool_stats().opened, 1);
}

/// Two connections, three sessions: the third does not get a connection in time.
pub async fn three_sessions_two_connections<D: Driver + Clone>(driver: &D, url: &str) {
    let config = test_config(url).with_pool(
        PoolConfig::default()
            .with_max_size(2)
            .with_acquire_timeout(ms(20)),
    );
    let manager = session_manager(driver, config).await;
    let inside = Arc::new(Barrier::new(3));
    let finished = Arc::new(AtomicUsize::new(0));
    let holders = (1..=2)
        .map(|_| {
            let manager = manager.clone();
            let inside = inside.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                manager
                    .with_session_once(IsolationLevel::ReadCommitted, move |_| {
                        let inside = inside.clone();
                        let finished = finished.clone();
                        async move {
                            inside.wait().await;
                            sleep(ms(50)).await;
                            Ok(finished.fetch_add(1, Ordering::SeqCst) + 1)
                        }
                        .boxed()
                    })
                    .await
            })
        })
        .collect::<Vec<_>>();
    inside.wait().await;

    let start = Instant::now();
    let result = manager
        .with_session_once(IsolationLevel::ReadCommitted, |_| async { Ok(()) }.boxed())
        .await;
    let elapsed = start.elapsed();
    assert!(
        matches!(result, Err(SessionError::PoolTimeout(..))),
        "Expected a pool timeout, got {:?}",
        result
    );
    assert!(elapsed >= ms(20));
    assert!(elapsed < ms(250), "The timeout took {:?}", elapsed);

    let mut orders = Vec::new();
    for holder in holders {
        let order = holder
            .await
            .expect("The session task panicked")
            .expect("The first two sessions must succeed");
        orders.push(order);
    }
    orders.sort();
    assert_eq!(orders, [1, 2]);
    let stats = manager.pool_stats();
    assert_eq!(stats.checked_out, 0);
    assert_eq!(stats.size, 2);
    assert_eq!(stats.peak_checked_out, 2);
    assert_eq!(stats.timeouts, 1);
}

pub async fn overflow<D: Driver + Clone>(driver: &D, url: &str) {
    let config = test_config(url).with_pool(
        PoolConfig::default()
            .with_max_size(1)
            .with_max_overflow(1)
            .with_acquire_timeout(ms(20)),
    );
    let manager = session_manager(driver, config).await;
    let mut first = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin the first transaction");
    let mut second = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin the overflow transaction");
    let stats = manager.pool_stats();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.overflow, 1);
    assert_eq!(stats.checked_out, 2);
    assert!(matches!(
        manager.begin(IsolationLevel::ReadCommitted).await,
        Err(SessionError::PoolTimeout(..))
    ));

    second.commit().await.expect("Could not commit");
    first.commit().await.expect("Could not commit");
    let stats = manager.pool_stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.overflow, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.closed, 1);
}

pub async fn drain<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    let mut held = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    // Leave one more connection idle.
    manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction")
        .commit()
        .await
        .expect("Could not commit");
    assert_eq!(manager.pool_stats().idle, 1);

    let draining = tokio::spawn({
        let manager = manager.clone();
        async move { manager.drain().await }
    });
    while !manager.pool().is_draining() {
        sleep(ms(1)).await;
    }
    assert!(matches!(
        manager.begin(IsolationLevel::ReadCommitted).await,
        Err(SessionError::PoolClosed)
    ));
    assert!(!draining.is_finished());
    held.commit()
        .await
        .expect("A transaction started before the drain can still commit");
    draining
        .await
        .expect("The drain task panicked")
        .expect("The drain should complete once every connection is back");
    let stats = manager.pool_stats();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.closed, 2);

    // A connection that never comes back.
    let config = test_config(url).with_pool(PoolConfig::default().with_shutdown_timeout(ms(30)));
    let manager = session_manager(driver, config).await;
    let mut held = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    let result = manager.drain().await;
    assert!(
        matches!(
            result,
            Err(SessionError::DrainTimeout { outstanding: 1, .. })
        ),
        "Expected a drain timeout, got {:?}",
        result
    );
    held.rollback().await.expect("Rollback never fails");
    assert_eq!(manager.pool_stats().size, 0);
}
