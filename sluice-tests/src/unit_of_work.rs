use crate::{Account, Bank, Transfer, balance, committed_rows, seed_accounts, session_manager, test_config};
use anyhow::anyhow;
use rust_decimal::Decimal;
use sluice::{Driver, Entity, IsolationLevel, Repository, SessionError, future::FutureExt};

fn accounts() -> [Account; 2] {
    [
        Account::new(1, "alice", Decimal::from(100)),
        Account::new(2, "bob", Decimal::from(50)),
    ]
}

pub async fn unit_of_work_transfer<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    seed_accounts(&manager, &accounts()).await;
    let bank = Bank::default();
    let amount = Decimal::from(30);

    let transfer = manager
        .unit_of_work(IsolationLevel::ReadCommitted, &bank, move |uow| {
            async move {
                let (tx, bank) = uow.split();
                let Some(mut from) = bank.accounts.find_for_update(tx, 1).await? else {
                    return Err(anyhow!("Account 1 does not exist").into());
                };
                let Some(mut to) = bank.accounts.find_for_update(tx, 2).await? else {
                    return Err(anyhow!("Account 2 does not exist").into());
                };
                from.balance -= amount;
                to.balance += amount;
                bank.accounts.save(tx, &mut from).await?;
                bank.accounts.save(tx, &mut to).await?;
                let mut transfer = Transfer {
                    id: 1,
                    version: 0,
                    from: from.id,
                    to: to.id,
                    amount,
                };
                bank.transfers.insert(tx, &mut transfer).await?;
                Ok(transfer)
            }
            .boxed()
        })
        .await
        .expect("The transfer failed");
    assert_eq!(transfer.version, 1);
    assert_eq!(balance(&manager, 1).await, Decimal::from(70));
    assert_eq!(balance(&manager, 2).await, Decimal::from(80));
    let transfers = committed_rows(&manager, Transfer::TABLE).await;
    assert_eq!(transfers.len(), 1);
    assert_eq!(
        Transfer::from_record(&transfers[0]).expect("A transfer"),
        transfer
    );
    let stored = committed_rows(&manager, Account::TABLE).await;
    assert!(stored.iter().all(|v| v.version == 2));
}

pub async fn unit_of_work_rollback<D: Driver + Clone>(driver: &D, url: &str) {
    let manager = session_manager(driver, test_config(url)).await;
    seed_accounts(&manager, &accounts()).await;
    let bank = Bank::default();
    let amount = Decimal::from(80);

    let result = manager
        .unit_of_work(IsolationLevel::ReadCommitted, &bank, move |uow| {
            async move {
                let (tx, bank) = uow.split();
                let mut to = bank
                    .accounts
                    .find_for_update(tx, 1)
                    .await?
                    .ok_or_else(|| anyhow!("Account 1 does not exist"))?;
                to.balance += amount;
                bank.accounts.save(tx, &mut to).await?;
                let from = bank
                    .accounts
                    .find_for_update(tx, 2)
                    .await?
                    .ok_or_else(|| anyhow!("Account 2 does not exist"))?;
                if from.balance < amount {
                    return Err(anyhow!(
                        "Insufficient funds: account {} holds {}, {} requested",
                        from.id,
                        from.balance,
                        amount
                    )
                    .into());
                }
                Ok(())
            }
            .boxed()
        })
        .await;
    assert!(
        matches!(&result, Err(SessionError::Application(e)) if e.to_string().contains("Insufficient funds")),
        "Expected the application error, got {:?}",
        result
    );
    assert_eq!(balance(&manager, 1).await, Decimal::from(100));
    assert_eq!(balance(&manager, 2).await, Decimal::from(50));
    assert!(committed_rows(&manager, Transfer::TABLE).await.is_empty());
    let stored = committed_rows(&manager, Account::TABLE).await;
    assert!(stored.iter().all(|v| v.version == 1));
    assert_eq!(manager.pool_stats().checked_out, 0);
}
