use crate::{clear_table, committed_rows, session_manager, test_config};
use anyhow::anyhow;
use sluice::{
    Driver, EntityKey, Fields, IsolationLevel, Pessimistic, Result, SessionError,
    TransactionState, Value, future::FutureExt,
};

const TABLE: &str = "savepoints";

fn item(name: &str) -> Fields {
    Fields::from([("name".into(), Value::from(name))])
}

fn names(rows: &[sluice::Record]) -> Vec<String> {
    rows.iter()
        .map(|v| v.get::<String>("name").expect("Column name"))
        .collect()
}

pub async fn savepoint_isolation<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, TABLE).await;
    let mut tx = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    tx.insert(TABLE, 1, item("before"))
        .await
        .expect("Could not insert");
    let savepoint = tx.savepoint("a").await.expect("Could not create savepoint");
    assert_eq!(savepoint.name, "a");
    assert_eq!(savepoint.depth, 1);
    tx.insert(TABLE, 2, item("after"))
        .await
        .expect("Could not insert");
    tx.update(TABLE, 1, item("changed after"))
        .await
        .expect("Could not update")
        .expect("Row 1 exists");
    tx.savepoint("b").await.expect("Could not create savepoint");
    tx.insert(TABLE, 3, item("deeper"))
        .await
        .expect("Could not insert");
    assert_eq!(tx.depth(), 2);

    tx.rollback_to("a").await.expect("Could not roll back");
    assert_eq!(
        tx.savepoints().iter().map(|v| &v.name).collect::<Vec<_>>(),
        ["a"],
        "Savepoints created after `a` are gone, `a` stays open"
    );
    let rows = tx
        .select(TABLE, Default::default())
        .await
        .expect("Could not select");
    assert_eq!(names(&rows), ["before"]);
    assert_eq!(rows[0].version, 1);

    tx.insert(TABLE, 4, item("after rollback"))
        .await
        .expect("The savepoint accepts further writes");
    tx.release("a").await.expect("Could not release");
    assert_eq!(tx.depth(), 0);
    tx.commit().await.expect("Could not commit");
    assert_eq!(tx.state(), TransactionState::Committed);

    let rows = committed_rows(&manager, TABLE).await;
    assert_eq!(names(&rows), ["before", "after rollback"]);
    assert_eq!(rows.iter().map(|v| v.id()).collect::<Vec<_>>(), [1, 4]);
    assert_eq!(rows[0].version, 1);
}

pub async fn savepoint_misuse<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, TABLE).await;
    let mut tx = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    tx.savepoint("x").await.expect("Could not create savepoint");
    assert!(matches!(
        tx.savepoint("x").await,
        Err(SessionError::InvalidState(..))
    ));
    assert!(matches!(
        tx.rollback_to("missing").await,
        Err(SessionError::InvalidState(..))
    ));
    assert!(matches!(
        tx.release("missing").await,
        Err(SessionError::InvalidState(..))
    ));
    tx.insert(TABLE, 1, item("kept"))
        .await
        .expect("Could not insert");

    let result = tx.commit().await;
    assert!(
        matches!(result, Err(SessionError::InvalidState(ref message)) if message.contains("x")),
        "Commit must refuse open savepoints, got {:?}",
        result
    );
    assert!(tx.is_open(), "A refused commit leaves the transaction open");
    tx.release("x").await.expect("Could not release");
    tx.commit().await.expect("Could not commit");
    assert!(matches!(
        tx.savepoint("y").await,
        Err(SessionError::InvalidState(..))
    ));
    assert_eq!(names(&committed_rows(&manager, TABLE).await), ["kept"]);

    // A function that leaves a savepoint open fails the session, nothing is committed.
    let result = manager
        .with_session_once(IsolationLevel::ReadCommitted, |tx| {
            async move {
                tx.insert(TABLE, 2, item("lost")).await?;
                tx.savepoint("left open").await?;
                Ok(())
            }
            .boxed()
        })
        .await;
    assert!(matches!(result, Err(SessionError::InvalidState(..))));
    assert_eq!(names(&committed_rows(&manager, TABLE).await), ["kept"]);
    assert_eq!(manager.pool_stats().checked_out, 0);
}

/// Rolling back to a savepoint forgets only the locks taken after it.
pub async fn savepoint_locks<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, TABLE).await;
    manager
        .transaction(|tx| {
            async move {
                tx.insert(TABLE, 1, item("one")).await?;
                tx.insert(TABLE, 2, item("two")).await?;
                Ok(())
            }
            .boxed()
        })
        .await
        .expect("Could not insert the rows");
    let (first, second) = (EntityKey::new(TABLE, 1), EntityKey::new(TABLE, 2));
    let lock = Pessimistic::default();

    let mut tx = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    tx.update(TABLE, 1, item("written"))
        .await
        .expect("Could not update")
        .expect("Row 1 exists");
    assert_eq!(tx.locks(), [first.clone()]);
    tx.savepoint("sp").await.expect("Could not create savepoint");
    let handle = lock
        .lock_for_update(&mut tx, &first)
        .await
        .expect("Could not lock")
        .expect("Row 1");
    lock.lock_for_update(&mut tx, &second)
        .await
        .expect("Could not lock")
        .expect("Row 2");
    assert_eq!(tx.locks(), [first.clone(), second.clone()]);

    tx.rollback_to("sp").await.expect("Could not roll back");
    assert_eq!(tx.locks(), [first.clone()]);
    assert!(handle.is_held_by(&tx), "Row 1 was locked before the savepoint");
    lock.update_locked(&mut tx, &handle, item("through the lock"))
        .await
        .expect("Row 1 is still locked");

    let mut other = manager
        .begin(IsolationLevel::ReadCommitted)
        .await
        .expect("Could not begin a transaction");
    Pessimistic::no_wait()
        .lock_for_update(&mut other, &second)
        .await
        .expect("Row 2 was released by the rollback")
        .expect("Row 2");
    let result = Pessimistic::no_wait().lock_for_update(&mut other, &first).await;
    assert!(
        matches!(result, Err(SessionError::RowLocked(ref locked)) if *locked == first),
        "Expected row 1 to be locked, got {:?}",
        result
    );
    other.rollback().await.expect("Rollback never fails");

    tx.release("sp").await.expect("Could not release");
    tx.commit().await.expect("Could not commit");
    assert_eq!(
        names(&committed_rows(&manager, TABLE).await),
        ["through the lock", "two"]
    );
}

/// Each item of a batch in its own savepoint: a failing item does not abort the batch.
pub async fn nested<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, TABLE).await;
    let failures = manager
        .transaction(|tx| {
            async move {
                let mut failures = Vec::new();
                for (id, name) in [(1, "first"), (2, "invalid"), (3, "third")] {
                    let result: Result<()> = tx
                        .nested(move |tx| {
                            async move {
                                tx.insert(TABLE, id, item(name)).await?;
                                if name == "invalid" {
                                    return Err(anyhow!("Item {} is invalid", id).into());
                                }
                                Ok(())
                            }
                            .boxed()
                        })
                        .await;
                    if let Err(e) = result {
                        failures.push(e.to_string());
                    }
                    assert_eq!(tx.depth(), 0);
                }

                // Two levels: the inner failure is recovered by the outer savepoint.
                tx.nested(|tx| {
                    async move {
                        tx.insert(TABLE, 4, item("outer")).await?;
                        let inner = tx
                            .nested(|tx| {
                                async move {
                                    assert_eq!(tx.depth(), 2);
                                    tx.update(TABLE, 4, item("inner")).await?;
                                    Err::<(), _>(anyhow!("Inner failure").into())
                                }
                                .boxed()
                            })
                            .await;
                        assert!(inner.is_err());
                        assert_eq!(tx.depth(), 1);
                        Ok(())
                    }
                    .boxed()
                })
                .await?;
                Ok(failures)
            }
            .boxed()
        })
        .await
        .expect("The batch should commit");
    assert_eq!(failures, ["Item 2 is invalid"]);
    let rows = committed_rows(&manager, TABLE).await;
    assert_eq!(names(&rows), ["first", "third", "outer"]);
    assert!(rows.iter().all(|v| v.version == 1));
}
