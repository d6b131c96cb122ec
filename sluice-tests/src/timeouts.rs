use crate::{clear_table, committed_rows, ms, session_manager, test_config};
use sluice::{
    Driver, EntityKey, Fields, IsolationLevel, LockMode, Pessimistic, PoolConfig,
    SessionError, SessionManager, Value, future::FutureExt,
};
use tokio::time::{Instant, sleep, timeout};

const TABLE: &str = "timeouts";

fn label(text: &str) -> Fields {
    Fields::from([("label".into(), Value::from(text))])
}

async fn seed<D: Driver>(manager: &SessionManager<D>) {
    clear_table(manager, TABLE).await;
    manager
        .transaction(|tx| async move { tx.insert(TABLE, 1, label("original")).await.map(|_| ()) }.boxed())
        .await
        .expect("Could not insert the row");
}

/// Wait until every connection is back in the pool.
async fn settled<D: Driver>(manager: &SessionManager<D>) {
    for _ in 0..200 {
        if manager.pool_stats().checked_out == 0 {
            return;
        }
        sleep(ms(5)).await;
    }
    panic!(
        "Connections were not returned to the pool: {:?}",
        manager.pool_stats()
    );
}

pub async fn transaction_timeout<D: Driver + Clone>(driver: &D, url: &str) {
    let config = test_config(url).with_transaction_timeout(Some(ms(50)));
    let manager = session_manager(driver, config).await;
    seed(&manager).await;

    let start = Instant::now();
    let result = manager
        .with_session(IsolationLevel::ReadCommitted, |tx| {
            async move {
                assert!(tx.deadline().is_some());
                tx.insert(TABLE, 2, label("too slow")).await?;
                sleep(ms(1_000)).await;
                Ok(())
            }
            .boxed()
        })
        .await;
    let elapsed = start.elapsed();
    assert!(
        matches!(result, Err(SessionError::TransactionTimeout(limit)) if limit == ms(50)),
        "Expected a transaction timeout, got {:?}",
        result
    );
    assert!(elapsed < ms(500), "The timeout took {:?}", elapsed);
    assert_eq!(manager.pool_stats().checked_out, 0);
    assert_eq!(committed_rows(&manager, TABLE).await.len(), 1);

    // The transaction deadline also bounds a lock wait.
    let mut holder = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    Pessimistic::default()
        .lock_for_update(&mut holder, &EntityKey::new(TABLE, 1))
        .await
        .expect("Could not lock")
        .expect("Row 1");
    let result = manager
        .with_session_once(IsolationLevel::ReadCommitted, |tx| {
            async move {
                Pessimistic::default()
                    .lock_for_update(tx, &EntityKey::new(TABLE, 1))
                    .await
            }
            .boxed()
        })
        .await;
    assert!(matches!(result, Err(SessionError::TransactionTimeout(..))));
    holder.rollback().await.expect("Rollback never fails");
    settled(&manager).await;
}

pub async fn lock_timeout<D: Driver + Clone>(driver: &D, url: &str) {
    let config = test_config(url).with_statement_timeout(Some(ms(50)));
    let manager = session_manager(driver, config).await;
    seed(&manager).await;
    let key = EntityKey::new(TABLE, 1);
    let mut a = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    let mut b = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    a.update(TABLE, 1, label("changed by a"))
        .await
        .expect("Could not update")
        .expect("Row 1");

    let start = Instant::now();
    let result = Pessimistic::new(LockMode::Wait)
        .lock_for_update(&mut b, &key)
        .await;
    assert!(
        matches!(
            result,
            Err(SessionError::LockTimeout { key: ref locked, timeout }) if *locked == key && timeout == ms(50)
        ),
        "Expected a lock timeout, got {:?}",
        result
    );
    assert!(start.elapsed() >= ms(50));
    assert!(b.is_open());
    // Plain reads never wait for locks.
    let row = b
        .fetch_one(TABLE, 1)
        .await
        .expect("Could not read")
        .expect("Row 1");
    assert_eq!(row.get::<String>("label").expect("Column label"), "original");

    a.commit().await.expect("Could not commit");
    let handle = Pessimistic::new(LockMode::Wait)
        .lock_for_update(&mut b, &key)
        .await
        .expect("The lock was released by the commit")
        .expect("Row 1");
    assert_eq!(handle.record.version, 2);
    b.commit().await.expect("Could not commit");
}

/// Dropping a transaction, a session future or an acquire future gives everything back.
pub async fn cancellation_releases<D: Driver + Clone>(driver: &D, url: &str) {
    let config = test_config(url).with_statement_timeout(Some(ms(2_000)));
    let manager = session_manager(driver, config).await;
    seed(&manager).await;
    let key = EntityKey::new(TABLE, 1);

    let mut abandoned = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    Pessimistic::default()
        .lock_for_update(&mut abandoned, &key)
        .await
        .expect("Could not lock")
        .expect("Row 1");
    abandoned
        .update(TABLE, 1, label("never committed"))
        .await
        .expect("Could not update");
    drop(abandoned);
    let mut next = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    let handle = Pessimistic::default()
        .lock_for_update(&mut next, &key)
        .await
        .expect("The lock of a dropped transaction is released")
        .expect("Row 1");
    assert_eq!(
        handle.record.get::<String>("label").expect("Column label"),
        "original"
    );
    next.commit().await.expect("Could not commit");
    settled(&manager).await;

    let cancelled = timeout(
        ms(20),
        manager.with_session(IsolationLevel::ReadCommitted, |tx| {
            async move {
                tx.insert(TABLE, 3, label("cancelled")).await?;
                sleep(ms(1_000)).await;
                Ok(())
            }
            .boxed()
        }),
    )
    .await;
    assert!(cancelled.is_err());
    settled(&manager).await;
    let rows = committed_rows(&manager, TABLE).await;
    assert_eq!(rows.iter().map(|v| v.id()).collect::<Vec<_>>(), [1]);

    let config = test_config(url).with_pool(PoolConfig::default().with_max_size(1));
    let manager = session_manager(driver, config).await;
    let mut held = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    assert!(timeout(ms(20), manager.pool().acquire(ms(1_000))).await.is_err());
    let stats = manager.pool_stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.checked_out, 1);
    held.commit().await.expect("Could not commit");
    let connection = manager
        .pool()
        .acquire(ms(20))
        .await
        .expect("The cancelled acquire did not keep a slot");
    connection.release().await;
}
