use crate::{clear_table, committed_rows, session_manager, test_config};
use anyhow::anyhow;
use sluice::{
    AsValue, Driver, ErrorKind, Fields, IsolationLevel, SessionError, TransactionState,
    future::FutureExt,
};
use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

const TABLE: &str = "atomicity";

fn fields(n: i64) -> Fields {
    Fields::from([("n".into(), n.as_value())])
}

pub async fn atomicity<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, TABLE).await;
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result = manager
        .with_session(IsolationLevel::ReadCommitted, move |tx| {
            let attempts = counter.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                for id in 1..=5 {
                    tx.insert(TABLE, id, fields(id)).await?;
                }
                assert_eq!(tx.select(TABLE, Default::default()).await?.len(), 5);
                Err::<(), _>(anyhow!("The batch failed validation").into())
            }
            .boxed()
        })
        .await;
    let Err(error) = result else {
        panic!("The session should fail");
    };
    assert_eq!(error.kind(), ErrorKind::Application);
    assert_eq!(error.to_string(), "The batch failed validation");
    assert_eq!(attempts.load(Ordering::SeqCst), 1, "Fatal errors are not retried");
    assert!(committed_rows(&manager, TABLE).await.is_empty());
    assert_eq!(manager.pool_stats().checked_out, 0);

    manager
        .with_session(IsolationLevel::ReadCommitted, |tx| {
            async move {
                for id in 1..=5 {
                    tx.insert(TABLE, id, fields(id)).await?;
                }
                Ok(())
            }
            .boxed()
        })
        .await
        .expect("Could not insert the rows");
    let rows = committed_rows(&manager, TABLE).await;
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|v| v.version == 1));
    assert_eq!(
        rows.iter()
            .map(|v| v.get::<i64>("n").expect("Column n"))
            .collect::<Vec<_>>(),
        [1, 2, 3, 4, 5]
    );
}

/// The function rolls back by itself and still returns a value.
pub async fn explicit_rollback<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, TABLE).await;
    let value = manager
        .transaction(|tx| {
            async move {
                tx.insert(TABLE, 10, fields(10)).await?;
                tx.rollback().await?;
                assert_eq!(tx.state(), TransactionState::RolledBack);
                assert!(matches!(
                    tx.insert(TABLE, 11, fields(11)).await,
                    Err(SessionError::InvalidState(..))
                ));
                Ok("rolled back")
            }
            .boxed()
        })
        .await
        .expect("A rolled back session is not an error");
    assert_eq!(value, "rolled back");
    assert!(committed_rows(&manager, TABLE).await.is_empty());

    // Committed by the function, nothing left to do for the manager.
    manager
        .transaction(|tx| {
            async move {
                tx.insert(TABLE, 12, fields(12)).await?;
                tx.commit().await?;
                assert!(matches!(
                    tx.commit().await,
                    Err(SessionError::InvalidState(..))
                ));
                assert!(matches!(
                    tx.rollback().await,
                    Err(SessionError::InvalidState(..))
                ));
                Ok(())
            }
            .boxed()
        })
        .await
        .expect("Could not commit");
    assert_eq!(committed_rows(&manager, TABLE).await.len(), 1);
    assert_eq!(manager.pool_stats().checked_out, 0);
}
