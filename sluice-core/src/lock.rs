use crate::{
    Driver, Entity, EntityKey, Fields, Filter, Record, Result, SessionError, Statement,
    TransactionContext, TransactionId,
};
use std::{borrow::Cow, future::Future};

/// Behaviour of `SELECT ... FOR UPDATE` when the row is locked by another transaction.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Wait for the lock, bounded by the statement timeout and the transaction deadline.
    #[default]
    Wait,
    /// Fail immediately with [`SessionError::RowLocked`].
    NoWait,
    /// Leave the locked row out of the result.
    SkipLocked,
}

/// A row locked for update by a transaction.
///
/// Only meaningful inside the transaction it was taken by, the lock goes away when that
/// transaction commits or rolls back.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHandle {
    pub key: EntityKey,
    pub transaction: TransactionId,
    pub record: Record,
}

impl LockHandle {
    pub fn is_held_by<D: Driver>(&self, tx: &TransactionContext<D>) -> bool {
        self.transaction == tx.id() && tx.is_open() && tx.holds_lock(&self.key)
    }
}

/// How a read-modify-write cycle is protected against concurrent writers.
pub trait LockStrategy: Send + Sync {
    /// Read the row that is about to be modified.
    fn load<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        key: &EntityKey,
    ) -> impl Future<Output = Result<Option<Record>>> + Send;

    /// Write back a row obtained from `load`.
    fn store<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        loaded: &Record,
        fields: Fields,
    ) -> impl Future<Output = Result<Record>> + Send;

    /// Load, apply `mutate` to the fields and store. `None` when the row does not exist.
    fn modify<D: Driver, F>(
        &self,
        tx: &mut TransactionContext<D>,
        key: &EntityKey,
        mutate: F,
    ) -> impl Future<Output = Result<Option<Record>>> + Send
    where
        F: FnOnce(&mut Fields) + Send,
    {
        async move {
            let Some(loaded) = self.load(tx, key).await? else {
                return Ok(None);
            };
            let mut fields = loaded.fields.clone();
            mutate(&mut fields);
            self.store(tx, &loaded, fields).await.map(Some)
        }
    }
}

/// Row locks taken with `SELECT ... FOR UPDATE`.
///
/// Rows must be locked in ascending [`EntityKey`] order, `lock_all` does it for the caller.
/// Locking in any other order can deadlock, the engine then aborts one of the transactions
/// with [`SessionError::DeadlockDetected`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pessimistic {
    pub mode: LockMode,
}

impl Pessimistic {
    pub fn new(mode: LockMode) -> Self {
        Self { mode }
    }

    pub fn no_wait() -> Self {
        Self::new(LockMode::NoWait)
    }

    pub fn skip_locked() -> Self {
        Self::new(LockMode::SkipLocked)
    }

    /// Lock one row. `None` when it does not exist or, in skip locked mode, when another
    /// transaction holds it.
    pub async fn lock_for_update<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        key: &EntityKey,
    ) -> Result<Option<LockHandle>> {
        let statement = Statement::select(key.table.clone())
            .filter(Filter::Ids(vec![key.id]))
            .for_update(self.mode);
        let Some(record) = tx.execute(&statement).await?.first() else {
            return Ok(None);
        };
        tx.register_lock(record.key.clone());
        Ok(Some(LockHandle {
            key: record.key.clone(),
            transaction: tx.id(),
            record,
        }))
    }

    /// Lock several rows in the global order, whatever the order of `keys`.
    pub async fn lock_all<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        keys: impl IntoIterator<Item = EntityKey>,
    ) -> Result<Vec<LockHandle>> {
        let mut keys: Vec<EntityKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut result = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(handle) = self.lock_for_update(tx, key).await? {
                result.push(handle);
            }
        }
        Ok(result)
    }

    /// Lock up to `limit` matching rows that no other transaction holds.
    ///
    /// Concurrent workers calling this on the same table get disjoint rows, an empty result
    /// means nothing is available right now. Never retried automatically.
    pub async fn lock_available<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        table: impl Into<Cow<'static, str>>,
        filter: Filter,
        limit: u32,
    ) -> Result<Vec<LockHandle>> {
        let statement = Statement::select(table)
            .filter(filter)
            .limit(limit)
            .for_update(LockMode::SkipLocked);
        let rows = tx.execute(&statement).await?;
        let transaction = tx.id();
        Ok(rows
            .into_iter()
            .map(|record| {
                tx.register_lock(record.key.clone());
                LockHandle {
                    key: record.key.clone(),
                    transaction,
                    record,
                }
            })
            .collect())
    }

    /// Write a row through its lock handle.
    pub async fn update_locked<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        handle: &LockHandle,
        fields: Fields,
    ) -> Result<Record> {
        if !handle.is_held_by(tx) {
            return Err(SessionError::invalid_state(format!(
                "The lock on {} belongs to {}, not to {}",
                handle.key,
                handle.transaction,
                tx.id()
            )));
        }
        self.store(tx, &handle.record, fields).await
    }
}

impl LockStrategy for Pessimistic {
    async fn load<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        key: &EntityKey,
    ) -> Result<Option<Record>> {
        Ok(self.lock_for_update(tx, key).await?.map(|v| v.record))
    }

    async fn store<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        loaded: &Record,
        fields: Fields,
    ) -> Result<Record> {
        if !tx.holds_lock(&loaded.key) {
            return Err(SessionError::invalid_state(format!(
                "Row {} is not locked by {}",
                loaded.key,
                tx.id()
            )));
        }
        let key = &loaded.key;
        tx.update(key.table.clone(), key.id, fields)
            .await?
            .ok_or_else(|| {
                SessionError::invalid_state(format!("Locked row {} disappeared", key))
            })
    }
}

/// Version checked writes without holding locks between read and write.
///
/// A write succeeds only if the row still has the version that was read, otherwise it fails
/// with [`SessionError::VersionConflict`] and the caller decides whether to re-read.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Optimistic;

impl Optimistic {
    /// Conditional update `WHERE id = ? AND version = expected_version`.
    pub async fn compare_and_swap<D: Driver, F>(
        &self,
        tx: &mut TransactionContext<D>,
        record: &Record,
        expected_version: u64,
        mutator: F,
    ) -> Result<Record>
    where
        F: FnOnce(&mut Fields),
    {
        let mut fields = record.fields.clone();
        mutator(&mut fields);
        let statement = Statement::update(record.key.table.clone(), record.id(), fields)
            .if_version(expected_version);
        match tx.execute(&statement).await?.first() {
            Some(updated) => Ok(updated),
            None => {
                log::debug!(
                    "[{}] version conflict on {} (expected {})",
                    tx.id(),
                    record.key,
                    expected_version
                );
                Err(SessionError::VersionConflict {
                    key: record.key.clone(),
                    expected: expected_version,
                })
            }
        }
    }

    /// Write the entity if nobody changed it since it was read, then bump its version.
    pub async fn save<D: Driver, E: Entity>(
        &self,
        tx: &mut TransactionContext<D>,
        entity: &mut E,
    ) -> Result<()> {
        let statement =
            Statement::update(E::TABLE, entity.id(), entity.to_fields()).if_version(entity.version());
        match tx.execute(&statement).await?.first() {
            Some(updated) => {
                entity.set_version(updated.version);
                Ok(())
            }
            None => Err(SessionError::VersionConflict {
                key: entity.key(),
                expected: entity.version(),
            }),
        }
    }
}

impl LockStrategy for Optimistic {
    async fn load<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        key: &EntityKey,
    ) -> Result<Option<Record>> {
        tx.fetch_one(key.table.clone(), key.id).await
    }

    async fn store<D: Driver>(
        &self,
        tx: &mut TransactionContext<D>,
        loaded: &Record,
        fields: Fields,
    ) -> Result<Record> {
        self.compare_and_swap(tx, loaded, loaded.version, |v| *v = fields)
            .await
    }
}
