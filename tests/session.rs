#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use sluice::{
        AsValue, EntityKey, Fields, IsolationLevel, LockStrategy, Optimistic, SessionConfig, SessionManager,
        future::FutureExt,
    };
    use sluice_memory::MemoryDriver;

    #[tokio::test]
    async fn transfer() {
        let driver = MemoryDriver::new();
        let database = driver.database().clone();
        let manager = SessionManager::connect(driver, SessionConfig::new("memory://session"))
            .await
            .expect("Could not create the session manager");
        manager
            .transaction(|tx| {
                async move {
                    for (id, balance) in [(1, 100), (2, 0)] {
                        let fields = Fields::from([(
                            "balance".into(),
                            Decimal::from(balance).as_value(),
                        )]);
                        tx.insert("accounts", id, fields).await?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
            .expect("Could not open the accounts");

        manager
            .with_session(IsolationLevel::RepeatableRead, |tx| {
                async move {
                    for (id, delta) in [(1, -25), (2, 25)] {
                        let key = EntityKey::new("accounts", id);
                        Optimistic
                            .modify(tx, &key, |fields| {
                                let balance = fields.get("balance").cloned().unwrap_or_default();
                                let balance = Decimal::try_from_value(balance).unwrap_or_default();
                                fields.insert(
                                    "balance".into(),
                                    (balance + Decimal::from(delta)).as_value(),
                                );
                            })
                            .await?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
            .expect("The transfer failed");

        let balances: Vec<Decimal> = database
            .rows("accounts")
            .iter()
            .map(|v| v.get("balance").expect("Column balance"))
            .collect();
        assert_eq!(balances, [Decimal::from(75), Decimal::from(25)]);
        assert!(database.rows("accounts").iter().all(|v| v.version == 2));
        manager.drain().await.expect("Could not drain the pool");
        assert_eq!(database.open_connections(), 0);
    }
}
