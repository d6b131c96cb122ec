use crate::{clear_table, session_manager, test_config};
use sluice::{
    AsValue, Driver, Fields, IsolationLevel, SessionError, TransactionState, future::FutureExt,
};

const TABLE: &str = "serializable";

fn value(n: i64) -> Fields {
    Fields::from([("value".into(), n.as_value())])
}

/// Snapshot transactions that lose a write race fail with a serialization conflict, the
/// session manager retries them from scratch.
pub async fn serializable_retried<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, TABLE).await;
    manager
        .transaction(|tx| async move { tx.insert(TABLE, 1, value(0)).await.map(|_| ()) }.boxed())
        .await
        .expect("Could not insert the counter");

    let mut a = manager
        .begin(IsolationLevel::Serializable)
        .await
        .expect("Could not begin a transaction");
    let mut b = manager
        .begin(IsolationLevel::Serializable)
        .await
        .expect("Could not begin a transaction");
    let seen_by_a = a
        .fetch_one(TABLE, 1)
        .await
        .expect("Could not read")
        .expect("The counter exists");
    let seen_by_b = b
        .fetch_one(TABLE, 1)
        .await
        .expect("Could not read")
        .expect("The counter exists");
    assert_eq!(seen_by_a.version, seen_by_b.version);
    a.update(TABLE, 1, value(1))
        .await
        .expect("Could not update")
        .expect("The counter exists");
    a.commit().await.expect("Could not commit");

    // `b` still reads its snapshot.
    let again = b
        .fetch_one(TABLE, 1)
        .await
        .expect("Could not read")
        .expect("The counter exists");
    assert_eq!(again.version, seen_by_b.version);
    let result = b.update(TABLE, 1, value(1)).await;
    assert!(
        matches!(result, Err(SessionError::SerializationConflict(..))),
        "Expected a serialization conflict, got {:?}",
        result
    );
    b.rollback().await.expect("Rollback never fails");
    assert_eq!(b.state(), TransactionState::RolledBack);

    // Concurrent read-modify-write cycles: conflicts are retried, no increment is lost.
    let tasks = (0..4)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .with_session(IsolationLevel::Serializable, |tx| {
                        async move {
                            let record = tx.fetch_one(TABLE, 1).await?.expect("The counter exists");
                            let current = record.get::<i64>("value")?;
                            tokio::task::yield_now().await;
                            tx.update(TABLE, 1, value(current + 1)).await?;
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
            .expect("The increment task panicked")
            .expect("Conflicts must be retried");
    }
    let record = manager
        .transaction(|tx| async move { tx.fetch_one(TABLE, 1).await }.boxed())
        .await
        .expect("Could not read the counter")
        .expect("The counter exists");
    assert_eq!(record.get::<i64>("value").expect("Column value"), 5);
    assert_eq!(record.version, 6);
}
