use rust_decimal::Decimal;
use sluice::{
    AsValue, Driver, Entity, EntityRepository, Fields, Filter, Record, Result, RetryConfig,
    SessionConfig, SessionManager,
    future::FutureExt,
};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: i64,
    pub version: u64,
    pub owner: String,
    pub balance: Decimal,
}

impl Account {
    pub fn new(id: i64, owner: &str, balance: Decimal) -> Self {
        Self {
            id,
            version: 0,
            owner: owner.into(),
            balance,
        }
    }
}

impl Entity for Account {
    const TABLE: &'static str = "accounts";

    fn id(&self) -> i64 {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn to_fields(&self) -> Fields {
        Fields::from([
            ("owner".into(), self.owner.clone().as_value()),
            ("balance".into(), self.balance.as_value()),
        ])
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.id(),
            version: record.version,
            owner: record.get("owner")?,
            balance: record.get("balance")?,
        })
    }
}

/// One entry of the ledger written next to every transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub id: i64,
    pub version: u64,
    pub from: i64,
    pub to: i64,
    pub amount: Decimal,
}

impl Entity for Transfer {
    const TABLE: &'static str = "transfers";

    fn id(&self) -> i64 {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn to_fields(&self) -> Fields {
        Fields::from([
            ("from".into(), self.from.as_value()),
            ("to".into(), self.to.as_value()),
            ("amount".into(), self.amount.as_value()),
        ])
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.id(),
            version: record.version,
            from: record.get("from")?,
            to: record.get("to")?,
            amount: record.get("amount")?,
        })
    }
}

/// Repositories a bank unit of work operates on.
#[derive(Default)]
pub struct Bank {
    pub accounts: EntityRepository<Account>,
    pub transfers: EntityRepository<Transfer>,
}

pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Configuration with short retry delays, tests never wait for a backoff longer than a few
/// milliseconds.
pub fn test_config(url: &str) -> SessionConfig {
    SessionConfig::new(url).with_retry(
        RetryConfig::default()
            .with_max_attempts(10)
            .with_base_delay(ms(1))
            .with_max_delay(ms(20)),
    )
}

pub async fn session_manager<D: Driver + Clone>(
    driver: &D,
    config: SessionConfig,
) -> SessionManager<D> {
    SessionManager::connect(driver.clone(), config)
        .await
        .expect("Could not create the session manager")
}

/// Delete every row of `table`.
pub async fn clear_table<D: Driver>(manager: &SessionManager<D>, table: &'static str) {
    manager
        .transaction(move |tx| {
            async move {
                for record in tx.select(table, Filter::All).await? {
                    tx.delete(table, record.id()).await?;
                }
                Ok(())
            }
            .boxed()
        })
        .await
        .expect("Could not clear the table");
}

/// Replace the content of the accounts table.
pub async fn seed_accounts<D: Driver>(manager: &SessionManager<D>, accounts: &[Account]) {
    clear_table(manager, Account::TABLE).await;
    clear_table(manager, Transfer::TABLE).await;
    let accounts = accounts.to_vec();
    manager
        .transaction(move |tx| {
            let accounts = accounts.clone();
            async move {
                for account in &accounts {
                    tx.insert(Account::TABLE, account.id, account.to_fields())
                        .await?;
                }
                Ok(())
            }
            .boxed()
        })
        .await
        .expect("Could not insert the accounts");
}

/// Committed rows of `table`, read in a separate transaction.
pub async fn committed_rows<D: Driver>(
    manager: &SessionManager<D>,
    table: &'static str,
) -> Vec<Record> {
    manager
        .transaction(move |tx| async move { tx.select(table, Filter::All).await }.boxed())
        .await
        .expect("Could not read the committed rows")
}

pub async fn balance<D: Driver>(manager: &SessionManager<D>, id: i64) -> Decimal {
    manager
        .transaction(move |tx| {
            async move {
                let record = tx.fetch_one(Account::TABLE, id).await?;
                match record {
                    Some(record) => record.get::<Decimal>("balance"),
                    None => Ok(Decimal::ZERO),
                }
            }
            .boxed()
        })
        .await
        .expect("Could not read the balance")
}
