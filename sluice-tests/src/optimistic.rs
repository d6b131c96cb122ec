use crate::{Account, clear_table, seed_accounts, session_manager, test_config};
use rust_decimal::Decimal;
use sluice::{
    AsValue, Driver, Entity, EntityKey, EntityRepository, Fields, IsolationLevel, LockStrategy,
    Optimistic, Pessimistic, Repository, SessionError, Value, future::FutureExt,
};
use std::sync::Arc;
use tokio::sync::Barrier;

const TABLE: &str = "counters";

/// Two writers read the same version, exactly one of them wins.
pub async fn optimistic_contention<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, TABLE).await;
    manager
        .transaction(|tx| {
            async move {
                tx.insert(TABLE, 1, Fields::from([("value".into(), 0i64.as_value())]))
                    .await?;
                Ok(())
            }
            .boxed()
        })
        .await
        .expect("Could not insert the counter");

    let both_read = Arc::new(Barrier::new(2));
    let increment = || {
        let both_read = both_read.clone();
        manager.with_session_once(IsolationLevel::ReadCommitted, move |tx| {
            let both_read = both_read.clone();
            async move {
                let record = tx
                    .fetch_one(TABLE, 1)
                    .await?
                    .expect("The counter exists");
                both_read.wait().await;
                let value = record.get::<i64>("value")?;
                Optimistic
                    .compare_and_swap(tx, &record, record.version, |fields| {
                        fields.insert("value".into(), (value + 1).as_value());
                    })
                    .await
            }
            .boxed()
        })
    };
    let (first, second) = tokio::join!(increment(), increment());
    let (winner, loser) = match (first, second) {
        (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
        (first, second) => panic!("Exactly one writer must win: {:?} {:?}", first, second),
    };
    assert_eq!(winner.version, 2);
    assert!(
        matches!(
            loser,
            SessionError::VersionConflict { ref key, expected: 1 } if *key == EntityKey::new(TABLE, 1)
        ),
        "Expected a version conflict, got {:?}",
        loser
    );

    let stored = manager
        .transaction(|tx| async move { tx.fetch_one(TABLE, 1).await }.boxed())
        .await
        .expect("Could not read the counter")
        .expect("The counter exists");
    assert_eq!(stored.version, 2, "The version grows by exactly one");
    assert_eq!(stored.value("value"), Some(&Value::Int64(Some(1))));
}

/// Stale entities are rejected, both strategies go through the same `modify`.
pub async fn optimistic_strategy<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    seed_accounts(&manager, &[Account::new(1, "ada", Decimal::new(100, 0))]).await;
    let repository = EntityRepository::<Account>::new();

    let load = || {
        manager.transaction(move |tx| {
            async move { repository.find(tx, 1).await.map(|v| v.expect("Account 1")) }.boxed()
        })
    };
    let mut fresh = load().await.expect("Could not load");
    let mut stale = load().await.expect("Could not load");
    assert_eq!(fresh.version, 1);

    fresh.balance += Decimal::new(5, 0);
    let fresh = manager
        .transaction(move |tx| {
            let mut fresh = fresh.clone();
            async move {
                repository.save(tx, &mut fresh).await?;
                Ok(fresh)
            }
            .boxed()
        })
        .await
        .expect("The first save succeeds");
    assert_eq!(fresh.version, 2);
    assert_eq!(fresh.balance, Decimal::new(105, 0));

    stale.balance -= Decimal::new(5, 0);
    let result = manager
        .with_session_once(IsolationLevel::ReadCommitted, move |tx| {
            let mut stale = stale.clone();
            async move { repository.save(tx, &mut stale).await }.boxed()
        })
        .await;
    assert!(matches!(
        result,
        Err(SessionError::VersionConflict { expected: 1, .. })
    ));

    let key = EntityKey::new(Account::TABLE, 1);
    let (optimistic, pessimistic) = manager
        .transaction(move |tx| {
            let key = key.clone();
            async move {
                let optimistic = Optimistic
                    .modify(tx, &key, |fields| {
                        fields.insert("owner".into(), Value::from("grace"));
                    })
                    .await?
                    .expect("Account 1");
                let pessimistic = Pessimistic::default()
                    .modify(tx, &key, |fields| {
                        fields.insert("balance".into(), Decimal::new(1, 0).as_value());
                    })
                    .await?
                    .expect("Account 1");
                assert!(tx.holds_lock(&key));
                let missing = Optimistic
                    .modify(tx, &EntityKey::new(Account::TABLE, 99), |_| {})
                    .await?;
                assert!(missing.is_none());
                Ok((optimistic, pessimistic))
            }
            .boxed()
        })
        .await
        .expect("Could not modify");
    assert_eq!(optimistic.version, 3);
    assert_eq!(pessimistic.version, 4);
    let account = Account::from_record(&pessimistic).expect("Could not decode");
    assert_eq!(account.owner, "grace");
    assert_eq!(account.balance, Decimal::new(1, 0));

    // Not locked by this transaction.
    let result = manager
        .with_session_once(IsolationLevel::ReadCommitted, move |tx| {
            let record = pessimistic.clone();
            async move {
                Pessimistic::default()
                    .store(tx, &record, record.fields.clone())
                    .await
            }
            .boxed()
        })
        .await;
    assert!(matches!(result, Err(SessionError::InvalidState(..))));
}
