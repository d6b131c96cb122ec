use crate::{Account, balance, ms, seed_accounts, session_manager, test_config};
use rust_decimal::Decimal;
use sluice::{
    AsValue, Driver, Entity, EntityKey, Fields, IsolationLevel, LockMode, Pessimistic,
    SessionError, future::FutureExt,
};
use tokio::time::sleep;

fn key(id: i64) -> EntityKey {
    EntityKey::new(Account::TABLE, id)
}

fn with_balance(mut fields: Fields, balance: Decimal) -> Fields {
    fields.insert("balance".into(), balance.as_value());
    fields
}

/// Transfers in both directions between the same accounts never deadlock when every
/// transaction locks its rows in key order.
pub async fn lock_order<D: Driver + Clone>(driver: &D, url: &str) {
    let config = test_config(url).with_statement_timeout(Some(ms(5_000)));
    let manager = session_manager(driver, config).await;
    seed_accounts(
        &manager,
        &[
            Account::new(1, "ada", Decimal::new(1_000, 0)),
            Account::new(2, "grace", Decimal::new(1_000, 0)),
        ],
    )
    .await;
    let tasks = (0..8)
        .map(|n| {
            let manager = manager.clone();
            let (from, to) = if n % 2 == 0 { (1, 2) } else { (2, 1) };
            tokio::spawn(async move {
                for _ in 0..5 {
                    manager
                        .with_session_once(IsolationLevel::ReadCommitted, move |tx| {
                            async move {
                                // Keys in transfer order, `lock_all` sorts them.
                                let handles = Pessimistic::default()
                                    .lock_all(tx, [key(from), key(to)])
                                    .await?;
                                assert_eq!(handles[0].key, key(1));
                                assert_eq!(handles[1].key, key(2));
                                let amount = Decimal::new(10, 0);
                                for handle in &handles {
                                    let current = handle.record.get::<Decimal>("balance")?;
                                    let updated = if handle.key.id == from {
                                        current - amount
                                    } else {
                                        current + amount
                                    };
                                    Pessimistic::default()
                                        .update_locked(
                                            tx,
                                            handle,
                                            with_balance(handle.record.fields.clone(), updated),
                                        )
                                        .await?;
                                }
                                Ok(())
                            }
                            .boxed()
                        })
                        .await?;
                }
                Ok::<_, SessionError>(())
            })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await
            .expect("The transfer task panicked")
            .expect("Ordered locking must never deadlock");
    }
    let (first, second) = (balance(&manager, 1).await, balance(&manager, 2).await);
    assert_eq!(first + second, Decimal::new(2_000, 0));
    assert_eq!(first, Decimal::new(1_000, 0), "Same number of transfers each way");
}

/// Locking in opposite orders: the engine detects the cycle and aborts one transaction.
pub async fn reverse_order_deadlock<D: Driver + Clone>(driver: &D, url: &str) {
    let config = test_config(url).with_statement_timeout(Some(ms(5_000)));
    let manager = session_manager(driver, config).await;
    seed_accounts(
        &manager,
        &[
            Account::new(1, "ada", Decimal::new(100, 0)),
            Account::new(2, "grace", Decimal::new(100, 0)),
        ],
    )
    .await;
    let lock = Pessimistic::new(LockMode::Wait);
    let mut a = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    let mut b = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    lock.lock_for_update(&mut a, &key(1))
        .await
        .expect("Could not lock")
        .expect("Account 1");
    lock.lock_for_update(&mut b, &key(2))
        .await
        .expect("Could not lock")
        .expect("Account 2");

    let waiting = tokio::spawn(async move {
        let result = lock.lock_for_update(&mut a, &key(2)).await;
        (a, result)
    });
    // Give `a` the time to start waiting.
    sleep(ms(50)).await;
    assert!(!waiting.is_finished());
    let result = lock.lock_for_update(&mut b, &key(1)).await;
    assert!(
        matches!(result, Err(SessionError::DeadlockDetected(..))),
        "Expected a deadlock, got {:?}",
        result
    );
    b.rollback().await.expect("Rollback never fails");

    let (mut a, result) = waiting.await.expect("The waiting task panicked");
    let handle = result
        .expect("The surviving transaction gets the lock")
        .expect("Account 2");
    assert!(handle.is_held_by(&a));
    assert_eq!(a.locks(), [key(1), key(2)]);
    a.commit().await.expect("Could not commit");
    assert!(!handle.is_held_by(&a));
}

pub async fn no_wait<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    seed_accounts(
        &manager,
        &[
            Account::new(1, "ada", Decimal::new(100, 0)),
            Account::new(2, "grace", Decimal::new(100, 0)),
        ],
    )
    .await;
    let mut a = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    let mut b = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    Pessimistic::default()
        .lock_for_update(&mut a, &key(1))
        .await
        .expect("Could not lock")
        .expect("Account 1");

    let result = Pessimistic::no_wait().lock_for_update(&mut b, &key(1)).await;
    assert!(
        matches!(result, Err(SessionError::RowLocked(ref locked)) if *locked == key(1)),
        "Expected the row to be locked, got {:?}",
        result
    );
    assert!(b.is_open(), "A locked row is not a broken transaction");
    assert!(!b.holds_lock(&key(1)));
    let handle = Pessimistic::no_wait()
        .lock_for_update(&mut b, &key(2))
        .await
        .expect("Row 2 is free")
        .expect("Account 2");
    assert!(handle.is_held_by(&b));
    assert!(!handle.is_held_by(&a));

    // The lock belongs to `b`.
    let result = Pessimistic::default()
        .update_locked(&mut a, &handle, handle.record.fields.clone())
        .await;
    assert!(matches!(result, Err(SessionError::InvalidState(..))));

    a.commit().await.expect("Could not commit");
    let handle = Pessimistic::no_wait()
        .lock_for_update(&mut b, &key(1))
        .await
        .expect("Row 1 was released by the commit")
        .expect("Account 1");
    assert_eq!(handle.record.version, 1);
    b.rollback().await.expect("Rollback never fails");
}

/// Workers claiming jobs never get the same row.
#[cfg(not(feature = "disable-skip-locked"))]
pub async fn skip_locked<D: Driver + Clone>(driver: &D, url: &str) {
    use crate::clear_table;
    use sluice::Filter;
    const JOBS: &str = "jobs";
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, JOBS).await;
    manager
        .transaction(|tx| {
            async move {
                for id in 1..=5 {
                    tx.insert(
                        JOBS,
                        id,
                        Fields::from([("status".into(), sluice::Value::from("pending"))]),
                    )
                    .await?;
                }
                tx.insert(JOBS, 6, Fields::from([("status".into(), sluice::Value::from("done"))]))
                    .await?;
                Ok(())
            }
            .boxed()
        })
        .await
        .expect("Could not insert the jobs");

    let pending = || Filter::equals("status", "pending");
    let claim = Pessimistic::skip_locked();
    let mut workers = Vec::new();
    for _ in 0..3 {
        workers.push(
            manager
                .begin(IsolationLevel::ReadCommitted)
                .await
                .expect("Could not begin a transaction"),
        );
    }
    let mut claimed = Vec::new();
    for (worker, limit) in workers.iter_mut().zip([2, 2, 10]) {
        let handles = claim
            .lock_available(worker, JOBS, pending(), limit)
            .await
            .expect("Could not claim");
        assert!(handles.iter().all(|v| v.is_held_by(worker)));
        claimed.push(handles.iter().map(|v| v.key.id).collect::<Vec<_>>());
    }
    assert_eq!(claimed, [vec![1, 2], vec![3, 4], vec![5]]);

    // Nothing left: an empty result, not an error and not a wait.
    let mut late = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    let handles = claim
        .lock_available(&mut late, JOBS, pending(), 10)
        .await
        .expect("Could not claim");
    assert!(handles.is_empty());

    // The first worker finishes, its rows are available again.
    workers[0].rollback().await.expect("Rollback never fails");
    let handles = claim
        .lock_available(&mut late, JOBS, pending(), 10)
        .await
        .expect("Could not claim");
    assert_eq!(
        handles.iter().map(|v| v.key.id).collect::<Vec<_>>(),
        [1, 2]
    );
    late.commit().await.expect("Could not commit");
    for worker in &mut workers {
        worker.rollback().await.expect("Rollback never fails");
    }
}
