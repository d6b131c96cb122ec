use crate::{
    Driver, Entity, EntityKey, Filter, LockMode, Optimistic, Pessimistic, Result, SessionError,
    Statement, TransactionContext,
};
use std::{future::Future, marker::PhantomData};

/// One transaction together with the repositories that operate on it.
///
/// `R` is usually a plain struct whose fields are repositories. Everything done through a unit
/// of work commits or rolls back together.
pub struct UnitOfWork<'c, D: Driver, R> {
    context: &'c mut TransactionContext<D>,
    repositories: &'c R,
}

impl<'c, D: Driver, R> UnitOfWork<'c, D, R> {
    pub fn new(context: &'c mut TransactionContext<D>, repositories: &'c R) -> Self {
        Self {
            context,
            repositories,
        }
    }

    pub fn repositories(&self) -> &'c R {
        self.repositories
    }

    pub fn context(&mut self) -> &mut TransactionContext<D> {
        self.context
    }

    /// Both halves at once, to call a repository with the context.
    pub fn split(self) -> (&'c mut TransactionContext<D>, &'c R) {
        (self.context, self.repositories)
    }
}

/// Typed access to the rows of one [`Entity`].
///
/// Every operation has a default implementation, a repository only names its entity and adds
/// its own queries.
pub trait Repository<D: Driver>: Send + Sync {
    type Entity: Entity;

    fn find(
        &self,
        tx: &mut TransactionContext<D>,
        id: i64,
    ) -> impl Future<Output = Result<Option<Self::Entity>>> + Send {
        async move {
            tx.fetch_one(Self::Entity::TABLE, id)
                .await?
                .map(|v| Self::Entity::from_record(&v))
                .transpose()
        }
    }

    fn find_where(
        &self,
        tx: &mut TransactionContext<D>,
        filter: Filter,
    ) -> impl Future<Output = Result<Vec<Self::Entity>>> + Send {
        async move {
            tx.select(Self::Entity::TABLE, filter)
                .await?
                .iter()
                .map(Self::Entity::from_record)
                .collect()
        }
    }

    /// Read and lock the row, waiting for concurrent holders.
    fn find_for_update(
        &self,
        tx: &mut TransactionContext<D>,
        id: i64,
    ) -> impl Future<Output = Result<Option<Self::Entity>>> + Send {
        async move {
            let key = EntityKey::new(Self::Entity::TABLE, id);
            Pessimistic::new(LockMode::Wait)
                .lock_for_update(tx, &key)
                .await?
                .map(|v| Self::Entity::from_record(&v.record))
                .transpose()
        }
    }

    /// Lock up to `limit` matching rows nobody else holds, see [`Pessimistic::lock_available`].
    fn claim(
        &self,
        tx: &mut TransactionContext<D>,
        filter: Filter,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Self::Entity>>> + Send {
        async move {
            Pessimistic::skip_locked()
                .lock_available(tx, Self::Entity::TABLE, filter, limit)
                .await?
                .iter()
                .map(|v| Self::Entity::from_record(&v.record))
                .collect()
        }
    }

    /// Insert the entity, its version is set to the stored one.
    fn insert(
        &self,
        tx: &mut TransactionContext<D>,
        entity: &mut Self::Entity,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            let record = tx
                .insert(Self::Entity::TABLE, entity.id(), entity.to_fields())
                .await?;
            entity.set_version(record.version);
            Ok(())
        }
    }

    /// Version checked update, see [`Optimistic::save`].
    fn save(
        &self,
        tx: &mut TransactionContext<D>,
        entity: &mut Self::Entity,
    ) -> impl Future<Output = Result<()>> + Send {
        async move { Optimistic.save(tx, entity).await }
    }

    /// Version checked delete.
    fn remove(
        &self,
        tx: &mut TransactionContext<D>,
        entity: &Self::Entity,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            let statement =
                Statement::delete(Self::Entity::TABLE, entity.id()).if_version(entity.version());
            if tx.execute(&statement).await?.rows_affected == 0 {
                return Err(SessionError::VersionConflict {
                    key: entity.key(),
                    expected: entity.version(),
                });
            }
            Ok(())
        }
    }
}

/// Repository with nothing but the default operations.
pub struct EntityRepository<E>(PhantomData<fn() -> E>);

impl<E> EntityRepository<E> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for EntityRepository<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EntityRepository<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> Copy for EntityRepository<E> {}

impl<D: Driver, E: Entity> Repository<D> for EntityRepository<E> {
    type Entity = E;
}
