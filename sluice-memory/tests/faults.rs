#[cfg(test)]
mod tests {
    use indoc::indoc;
    use sluice_core::{
        Driver, EntityKey, ErrorKind, Fields, Filter, IsolationLevel, Pessimistic,
        PoolConfig, RetryConfig, SessionConfig, SessionError, SessionManager, Value,
        future::FutureExt,
    };
    use sluice_memory::{Fault, MemoryDatabase, MemoryDriver};
    use sluice_tests::{init_logs, silent_logs};
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };
    use tokio::time::sleep;

    const TABLE: &str = "faults";

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn fields(name: &str) -> Fields {
        Fields::from([("name".into(), Value::from(name))])
    }

    fn config() -> SessionConfig {
        SessionConfig::new("memory://faults").with_retry(
            RetryConfig::default()
                .with_max_attempts(4)
                .with_base_delay(ms(1))
                .with_max_delay(ms(5)),
        )
    }

    async fn manager(config: SessionConfig) -> (SessionManager<MemoryDriver>, Arc<MemoryDatabase>) {
        let driver = MemoryDriver::new();
        let database = driver.database().clone();
        let manager = SessionManager::connect(driver, config)
            .await
            .expect("Could not create the session manager");
        (manager, database)
    }

    /// Insert row `id` in a retried session, returns how many attempts it took.
    async fn insert_counting(
        manager: &SessionManager<MemoryDriver>,
        id: i64,
    ) -> (Result<(), SessionError>, u32) {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = manager
            .with_session(IsolationLevel::ReadCommitted, move |tx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    tx.insert(TABLE, id, fields("inserted")).await?;
                    Ok(())
                }
                .boxed()
            })
            .await;
        (result, attempts.load(Ordering::Relaxed))
    }

    #[tokio::test]
    async fn lost_connection_is_retried() {
        init_logs();
        let (manager, database) = manager(config()).await;
        database.fail_next_statements(Fault::Disconnect, 1);
        let (result, attempts) = insert_counting(&manager, 1).await;
        result.expect("The second attempt succeeds");
        assert_eq!(attempts, 2);
        assert!(database.row(TABLE, 1).is_some());
        let stats = manager.pool_stats();
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.checked_out, 0);
        assert_eq!(database.open_connections(), 1);
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        init_logs();
        let (manager, database) = manager(config()).await;
        database.fail_next_statements(Fault::SerializationFailure, 2);
        database.fail_next_statements(Fault::Deadlock, 1);
        let (result, attempts) = insert_counting(&manager, 1).await;
        result.expect("The fourth attempt succeeds");
        assert_eq!(attempts, 4);
        // Conflicts leave the connection usable.
        assert_eq!(manager.pool_stats().opened, 1);

        database.fail_next_statements(Fault::SerializationFailure, 4);
        let (result, attempts) = insert_counting(&manager, 2).await;
        assert!(
            matches!(
                &result,
                Err(SessionError::RetriesExhausted { attempts: 4, last })
                    if last.kind() == ErrorKind::SerializationConflict
            ),
            "Expected the retries to be exhausted, got {:?}",
            result
        );
        assert_eq!(attempts, 4);
        assert!(database.row(TABLE, 2).is_none());

        database.fail_next_statements(Fault::Internal, 1);
        let (result, attempts) = insert_counting(&manager, 3).await;
        assert_eq!(result.map_err(|e| e.kind()), Err(ErrorKind::Driver));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn commit_in_doubt_is_not_retried() {
        init_logs();
        let (manager, database) = manager(config()).await;
        database.fail_next_commits(1);
        let (result, attempts) = insert_counting(&manager, 1).await;
        assert!(
            matches!(result, Err(SessionError::CommitInDoubt(..))),
            "Expected the commit to be in doubt, got {:?}",
            result
        );
        assert_eq!(attempts, 1);
        // The memory engine loses the connection before applying the commit.
        assert!(database.row(TABLE, 1).is_none());
        assert_eq!(database.active_transactions(), 0);
        assert_eq!(database.locks_held(), 0);
        assert_eq!(manager.pool_stats().closed, 1);

        let mut tx = manager
            .begin(IsolationLevel::ReadCommitted)
            .await
            .expect("Could not begin a transaction");
        tx.insert(TABLE, 1, fields("second try"))
            .await
            .expect("Could not insert");
        database.fail_next_commits(1);
        let result = tx.commit().await;
        assert_eq!(result.map_err(|e| e.kind()), Err(ErrorKind::CommitInDoubt));
        assert!(!tx.is_open());
        assert!(matches!(
            tx.commit().await,
            Err(SessionError::InvalidState(..))
        ));
    }

    #[tokio::test]
    async fn killed_connections_with_pre_ping() {
        init_logs();
        let pool = PoolConfig::default().with_max_size(2).with_pre_ping(true);
        let (manager, database) = manager(config().with_pool(pool)).await;
        insert_counting(&manager, 1).await.0.expect("Could not insert");
        assert_eq!(manager.pool_stats().idle, 1);

        assert_eq!(database.kill_connections(), 0);
        let (result, attempts) = insert_counting(&manager, 2).await;
        result.expect("The dead connection is replaced on checkout");
        assert_eq!(attempts, 1);
        let stats = manager.pool_stats();
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.closed, 1);

        database.fail_liveness_probes(1);
        let tx = manager
            .begin(IsolationLevel::ReadCommitted)
            .await
            .expect("Could not begin a transaction");
        drop(tx);
        let stats = manager.pool_stats();
        assert_eq!(stats.opened, 3);
        assert_eq!(stats.closed, 2);
    }

    #[tokio::test]
    async fn killed_connections_without_pre_ping() {
        init_logs();
        let (manager, database) = manager(config()).await;
        insert_counting(&manager, 1).await.0.expect("Could not insert");

        let mut tx = manager
            .begin(IsolationLevel::ReadCommitted)
            .await
            .expect("Could not begin a transaction");
        tx.update(TABLE, 1, fields("lost"))
            .await
            .expect("Could not update");
        assert_eq!(database.locks_held(), 1);
        assert_eq!(database.kill_connections(), 1);
        assert_eq!(database.locks_held(), 0);
        let result = tx.fetch_one(TABLE, 1).await;
        assert_eq!(result.map_err(|e| e.kind()), Err(ErrorKind::Disconnected));
        tx.rollback().await.expect("Rollback never fails");
        assert_eq!(
            database
                .row(TABLE, 1)
                .expect("Row 1")
                .get::<String>("name")
                .expect("Column name"),
            "inserted"
        );

        // Stale idle connection: begin fails, the retry opens a new one.
        insert_counting(&manager, 2).await.0.expect("Could not insert");
        database.kill_connections();
        let (result, attempts) = insert_counting(&manager, 3).await;
        result.expect("The retry uses a new connection");
        assert_eq!(attempts, 1);
        let stats = manager.pool_stats();
        assert_eq!(stats.opened, 3);
        assert_eq!(stats.closed, 2);
    }

    #[tokio::test]
    async fn failed_probe_on_release() {
        init_logs();
        let pool = PoolConfig::default().with_max_size(1);
        let (manager, database) = manager(config().with_pool(pool)).await;
        let pool = manager.pool();
        let connection = pool.acquire(ms(100)).await.expect("Could not acquire");
        let first = connection.id();
        database.fail_liveness_probes(1);
        pool.release(connection).await;
        let stats = pool.stats();
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.idle, 0);

        let connection = pool.acquire(ms(100)).await.expect("Could not acquire");
        assert_ne!(connection.id(), first);
        let second = connection.id();
        pool.release(connection).await;
        let connection = pool.acquire(ms(100)).await.expect("Could not acquire");
        assert_eq!(connection.id(), second);
        pool.release(connection).await;
        let stats = pool.stats();
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn connections_are_recycled() {
        init_logs();
        let pool = PoolConfig::default().with_pool_recycle(Some(ms(30)));
        let (manager, _database) = manager(config().with_pool(pool)).await;
        insert_counting(&manager, 1).await.0.expect("Could not insert");
        insert_counting(&manager, 2).await.0.expect("Could not insert");
        assert_eq!(manager.pool_stats().opened, 1);
        sleep(ms(50)).await;
        insert_counting(&manager, 3).await.0.expect("Could not insert");
        let stats = manager.pool_stats();
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn refused_connections() {
        init_logs();
        let (manager, database) = manager(config()).await;
        database.refuse_connections(2);
        let (result, attempts) = insert_counting(&manager, 1).await;
        result.expect("The third connection attempt succeeds");
        assert_eq!(attempts, 1);
        assert_eq!(database.connections_opened(), 1);

        let (manager, database) = self::manager(config()).await;
        database.refuse_connections(1);
        let result = manager
            .with_session_once(IsolationLevel::ReadCommitted, |tx| {
                async move { tx.fetch_one(TABLE, 1).await }.boxed()
            })
            .await;
        assert_eq!(result.map_err(|e| e.kind()), Err(ErrorKind::Disconnected));
        assert_eq!(manager.pool_stats().size, 0);
    }

    #[tokio::test]
    async fn dropped_transaction_is_rolled_back() {
        init_logs();
        let (manager, database) = manager(config()).await;
        insert_counting(&manager, 1).await.0.expect("Could not insert");
        let mut tx = manager
            .begin(IsolationLevel::ReadCommitted)
            .await
            .expect("Could not begin a transaction");
        tx.insert(TABLE, 2, fields("dropped"))
            .await
            .expect("Could not insert");
        Pessimistic::default()
            .lock_for_update(&mut tx, &EntityKey::new(TABLE, 1))
            .await
            .expect("Could not lock")
            .expect("Row 1");
        assert_eq!(database.active_transactions(), 1);
        assert_eq!(database.locks_held(), 2);
        drop(tx);
        for _ in 0..200 {
            if manager.pool_stats().checked_out == 0 {
                break;
            }
            sleep(ms(5)).await;
        }
        assert_eq!(database.active_transactions(), 0);
        assert_eq!(database.locks_held(), 0);
        assert!(database.row(TABLE, 2).is_none());
        let stats = manager.pool_stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.closed, 0);
    }

    #[tokio::test]
    async fn repeatable_read_snapshot() {
        init_logs();
        let (manager, _database) = manager(config()).await;
        insert_counting(&manager, 1).await.0.expect("Could not insert");
        let mut a = manager
            .begin(IsolationLevel::RepeatableRead)
            .await
            .expect("Could not begin a transaction");
        let before = a
            .fetch_one(TABLE, 1)
            .await
            .expect("Could not read")
            .expect("Row 1");
        manager
            .transaction(|tx| async move { tx.update(TABLE, 1, fields("changed")).await }.boxed())
            .await
            .expect("Could not update");
        let again = a
            .fetch_one(TABLE, 1)
            .await
            .expect("Could not read")
            .expect("Row 1");
        assert_eq!(again, before);
        let result = a.update(TABLE, 1, fields("from the snapshot")).await;
        assert_eq!(
            result.map_err(|e| e.kind()),
            Err(ErrorKind::SerializationConflict)
        );
        a.rollback().await.expect("Rollback never fails");

        let mut b = manager
            .begin(IsolationLevel::ReadCommitted)
            .await
            .expect("Could not begin a transaction");
        let row = b
            .update(TABLE, 1, fields("read committed"))
            .await
            .expect("Read committed writes the latest version")
            .expect("Row 1");
        assert_eq!(row.version, 3);
        b.commit().await.expect("Could not commit");
    }

    #[tokio::test]
    async fn serializable_scan_conflict() {
        init_logs();
        let (manager, database) = manager(config()).await;
        insert_counting(&manager, 1).await.0.expect("Could not insert");
        let mut a = manager
            .begin(IsolationLevel::Serializable)
            .await
            .expect("Could not begin a transaction");
        let rows = a.select(TABLE, Filter::All).await.expect("Could not scan");
        assert_eq!(rows.len(), 1);
        insert_counting(&manager, 2).await.0.expect("Could not insert");
        a.insert(TABLE, 3, fields("based on a stale scan"))
            .await
            .expect("The insert itself succeeds");
        let result = a.commit().await;
        assert!(
            matches!(&result, Err(SessionError::SerializationConflict(message)) if message.contains(TABLE)),
            "Expected a serialization conflict, got {:?}",
            result
        );
        assert!(!a.is_open());
        assert!(database.row(TABLE, 3).is_none());
        assert_eq!(database.active_transactions(), 0);

        // Nothing changed since the scan: commits.
        let mut c = manager
            .begin(IsolationLevel::Serializable)
            .await
            .expect("Could not begin a transaction");
        c.select(TABLE, Filter::All).await.expect("Could not scan");
        c.insert(TABLE, 3, fields("fresh scan"))
            .await
            .expect("Could not insert");
        c.commit().await.expect("Could not commit");
        assert_eq!(database.rows(TABLE).len(), 3);
    }

    #[tokio::test]
    async fn journal() {
        init_logs();
        let (manager, database) = manager(config()).await;
        database.enable_journal();
        manager
            .transaction(|tx| {
                async move {
                    tx.insert(TABLE, 1, fields("it's")).await?;
                    tx.savepoint("sp").await?;
                    tx.update(TABLE, 1, fields("discarded")).await?;
                    tx.rollback_to("sp").await?;
                    tx.release("sp").await?;
                    Pessimistic::no_wait()
                        .lock_for_update(tx, &EntityKey::new(TABLE, 1))
                        .await?;
                    Ok(())
                }
                .boxed()
            })
            .await
            .expect("Could not run the transaction");
        assert_eq!(
            database.take_journal().join("\n"),
            indoc! {r#"
                BEGIN ISOLATION LEVEL READ COMMITTED;
                INSERT INTO "faults" ("id", "version", "name") VALUES (1, 1, 'it''s');
                SAVEPOINT "sp";
                UPDATE "faults" SET "name" = 'discarded', "version" = "version" + 1 WHERE "id" = 1;
                ROLLBACK TO SAVEPOINT "sp";
                RELEASE SAVEPOINT "sp";
                SELECT * FROM "faults" WHERE "id" IN (1) ORDER BY "id" FOR UPDATE NOWAIT;
                COMMIT;"#}
            .trim()
        );
        assert!(database.take_journal().is_empty());
        assert_eq!(database.row(TABLE, 1).expect("Row 1").version, 1);
    }

    #[tokio::test]
    async fn wrong_url() {
        let driver = MemoryDriver::new();
        silent_logs! {
            assert!(driver.connect("sqlite://memory").await.is_err());
        }
        assert!(driver.connect("memory://other").await.is_ok());
        assert_eq!(driver.database().open_connections(), 0);
        let config = SessionConfig::new("postgres://localhost/bank");
        let manager = SessionManager::connect(driver.clone(), config)
            .await
            .expect("No connection is opened with min_idle 0");
        silent_logs! {
            let result = manager.begin(IsolationLevel::ReadCommitted).await;
            assert!(matches!(result.map_err(|e| e.kind()), Err(ErrorKind::Driver)));
        }
    }
}
