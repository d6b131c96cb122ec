use crate::{clear_table, ms, session_manager, silent_logs, test_config};
use sluice::{
    Driver, EntityKey, ErrorClass, ErrorKind, Fields, Filter, IsolationLevel, RetryConfig,
    RetryPolicy, SessionError, Value, future::FutureExt,
};
use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};
use tokio::time::Instant;

/// A transaction that always fails with a transient error runs exactly `max_attempts` times.
pub async fn retry_boundedness<D: Driver + Clone>(driver: &D, url: &str) {
    let retry = RetryConfig::default()
        .with_max_attempts(4)
        .with_base_delay(ms(5))
        .with_max_delay(ms(20))
        .with_jitter(false);
    let manager = session_manager(driver, test_config(url).with_retry(retry)).await;
    let policy = manager.retry_policy().clone();
    assert_eq!(policy.max_total_delay(), ms(5 + 10 + 20));

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let start = Instant::now();
    let result;
    silent_logs! {
        result = manager
            .with_session(IsolationLevel::Serializable, move |_| {
                let attempts = counter.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SessionError::SerializationConflict(
                        "could not serialize access".into(),
                    ))
                }
                .boxed()
            })
            .await;
    }
    let elapsed = start.elapsed();
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    match result {
        Err(SessionError::RetriesExhausted { attempts, ref last }) => {
            assert_eq!(attempts, 4);
            assert_eq!(last.kind(), ErrorKind::SerializationConflict);
        }
        ref other => panic!("Expected the retries to be exhausted, got {:?}", other),
    }
    let Err(error) = result else { unreachable!() };
    assert_eq!(error.root().kind(), ErrorKind::SerializationConflict);
    assert!(elapsed >= policy.max_total_delay());
    assert!(
        elapsed < policy.max_total_delay() + ms(500),
        "Retrying took {:?}",
        elapsed
    );
    assert_eq!(manager.pool_stats().checked_out, 0);
}

pub async fn fatal_not_retried<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result = manager
        .with_session(IsolationLevel::ReadCommitted, move |_| {
            let attempts = counter.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SessionError::VersionConflict {
                    key: EntityKey::new("counters", 1),
                    expected: 3,
                })
            }
            .boxed()
        })
        .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(
        result,
        Err(SessionError::VersionConflict { expected: 3, .. })
    ));

    // Transient twice, then the third attempt succeeds.
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let value;
    silent_logs! {
        value = manager
            .with_session(IsolationLevel::ReadCommitted, move |_| {
                let attempts = counter.clone();
                async move {
                    match attempts.fetch_add(1, Ordering::SeqCst) + 1 {
                        n if n < 3 => Err(SessionError::DeadlockDetected(format!("attempt {}", n))),
                        n => Ok(n),
                    }
                }
                .boxed()
            })
            .await
            .expect("The third attempt succeeds");
    }
    assert_eq!(value, 3);

    // A custom classifier decides what is worth retrying.
    let policy = RetryPolicy::new(&RetryConfig::default().with_base_delay(ms(1)))
        .with_classifier(|e| match e {
            SessionError::RowLocked(..) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        });
    let manager = manager.with_retry_policy(policy);
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result;
    silent_logs! {
        result = manager
            .with_session(IsolationLevel::ReadCommitted, move |_| {
                let attempts = counter.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SessionError::RowLocked(EntityKey::new("jobs", 1)))
                }
                .boxed()
            })
            .await;
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        result.map_err(|e| e.root().kind()).unwrap_err(),
        ErrorKind::RowLocked
    );
}

/// Work the application committed itself is never run again, whatever fails afterwards.
pub async fn committed_not_retried<D: Driver + Clone>(driver: &D, url: &str) {
    const EVENTS: &str = "events";
    let manager = session_manager(driver, test_config(url)).await;
    clear_table(&manager, EVENTS).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result;
    silent_logs! {
        result = manager
            .with_session(IsolationLevel::ReadCommitted, move |tx| {
                let attempts = counter.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    tx.insert(
                        EVENTS,
                        n as i64,
                        Fields::from([("kind".into(), Value::from("committed"))]),
                    )
                    .await?;
                    tx.commit().await?;
                    Err::<(), _>(SessionError::DeadlockDetected("after the commit".into()))
                }
                .boxed()
            })
            .await;
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(
        matches!(result, Err(SessionError::DeadlockDetected(..))),
        "Expected the error to be returned as it is, got {:?}",
        result
    );
    let rows = manager
        .transaction(|tx| tx.select(EVENTS, Filter::All).boxed())
        .await
        .expect("Could not read the events");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id(), 1);
    assert_eq!(manager.pool_stats().checked_out, 0);
}
