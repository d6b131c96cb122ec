use crate::{
    ConnectionPool, Driver, IsolationLevel, PoolStats, Result, RetryPolicy, SessionConfig,
    SessionError, TransactionContext, TransactionId, TransactionOptions, TransactionState,
    UnitOfWork,
};
use futures::future::BoxFuture;
use std::{future::Future, sync::Arc};
use tokio::time::{Instant, sleep, timeout_at};

/// Runs application code inside transactions over a pool of connections.
///
/// ```rust,ignore
/// let total = manager
///     .transaction(|tx| {
///         async move {
///             let rows = tx.select("accounts", Filter::All).await?;
///             rows.iter().map(|v| v.get::<i64>("balance")).sum::<Result<i64>>()
///         }
///         .boxed()
///     })
///     .await?;
/// ```
pub struct SessionManager<D: Driver> {
    pool: ConnectionPool<D>,
    config: Arc<SessionConfig>,
    retry: RetryPolicy,
}

impl<D: Driver> Clone for SessionManager<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            config: self.config.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<D: Driver> SessionManager<D> {
    pub async fn connect(driver: D, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::connect(driver, config.url.clone(), config.pool.clone()).await?;
        Ok(Self {
            pool,
            retry: RetryPolicy::new(&config.retry),
            config: Arc::new(config),
        })
    }

    /// Replace the policy built from the configuration.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn pool(&self) -> &ConnectionPool<D> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Check out a connection and start a transaction the caller drives by hand.
    pub async fn begin(&self, isolation: IsolationLevel) -> Result<TransactionContext<D>> {
        let connection = self.pool.acquire(self.config.pool.acquire_timeout).await?;
        TransactionContext::begin(
            connection,
            TransactionOptions {
                isolation,
                statement_timeout: self.config.statement_timeout,
            },
            self.config.transaction_timeout,
        )
        .await
    }

    /// Run `f` in a transaction at the default isolation level.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut TransactionContext<D>) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.with_session(self.config.default_isolation, f).await
    }

    /// Run `f` in a transaction, retrying the whole transaction on transient failures.
    ///
    /// A transaction `f` leaves open is committed when it returns `Ok` and rolled back when it
    /// returns `Err`. Every attempt gets a fresh connection and a fresh transaction, `f` must
    /// therefore not keep side effects outside of it. If `f` commits the transaction itself and
    /// then fails, its error is returned without retrying.
    pub async fn with_session<T, F>(&self, isolation: IsolationLevel, mut f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut TransactionContext<D>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut attempt = 1;
        loop {
            match self.run_once(isolation, &mut f).await {
                Ok(value) => return Ok(value),
                Err(failure) => attempt = self.retry_after(attempt, failure).await?,
            }
        }
    }

    /// Same as `with_session` but without retries.
    pub async fn with_session_once<T, F>(&self, isolation: IsolationLevel, mut f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut TransactionContext<D>) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.run_once(isolation, &mut f).await.map_err(|v| v.error)
    }

    /// Run `f` with a unit of work binding one transaction to `repositories`.
    ///
    /// Transaction handling and retries are the same as `with_session`.
    pub async fn unit_of_work<T, R, F>(
        &self,
        isolation: IsolationLevel,
        repositories: &R,
        mut f: F,
    ) -> Result<T>
    where
        T: Send,
        R: Sync,
        F: for<'c> FnMut(UnitOfWork<'c, D, R>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut attempt = 1;
        loop {
            let result = async {
                let mut tx = self.begin(isolation).await?;
                let (id, deadline) = (tx.id(), tx.deadline());
                let result = self
                    .bounded(id, deadline, f(UnitOfWork::new(&mut tx, repositories)))
                    .await;
                self.finish(tx, result).await
            }
            .await;
            match result {
                Ok(value) => return Ok(value),
                Err(failure) => attempt = self.retry_after(attempt, failure).await?,
            }
        }
    }

    /// Stop handing out connections and close them, see [`ConnectionPool::drain`].
    pub async fn drain(&self) -> Result<()> {
        self.pool.drain().await
    }

    /// Sleep before the next attempt and return its number.
    ///
    /// Work that was already committed is never run again, its error is returned as it is.
    async fn retry_after(&self, attempt: u32, failure: Failure) -> Result<u32> {
        if failure.committed {
            log::debug!(
                "Not retrying a transaction that was already committed: {:#}",
                failure.error
            );
            return Err(failure.error);
        }
        let next = self.retry.next_attempt(attempt, failure.error)?;
        sleep(next.delay).await;
        Ok(next.attempt)
    }

    async fn run_once<T, F>(
        &self,
        isolation: IsolationLevel,
        f: &mut F,
    ) -> std::result::Result<T, Failure>
    where
        F: for<'c> FnMut(&'c mut TransactionContext<D>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut tx = self.begin(isolation).await?;
        let (id, deadline) = (tx.id(), tx.deadline());
        let result = self.bounded(id, deadline, f(&mut tx)).await;
        self.finish(tx, result).await
    }

    /// Bound application code by the transaction deadline.
    async fn bounded<T>(
        &self,
        id: TransactionId,
        deadline: Option<Instant>,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let (Some(deadline), Some(timeout)) = (deadline, self.config.transaction_timeout) else {
            return future.await;
        };
        match timeout_at(deadline, future).await {
            Ok(result) => result,
            Err(..) => {
                log::warn!(
                    "{} exceeded its deadline of {:?} by {:?}",
                    id,
                    timeout,
                    Instant::now().saturating_duration_since(deadline)
                );
                Err(SessionError::TransactionTimeout(timeout))
            }
        }
    }

    /// Commit on success, roll back on failure.
    async fn finish<T>(
        &self,
        mut tx: TransactionContext<D>,
        result: Result<T>,
    ) -> std::result::Result<T, Failure> {
        match result {
            Ok(value) => {
                if tx.is_open()
                    && let Err(e) = tx.commit().await
                {
                    if tx.is_open() {
                        tx.rollback().await?;
                    }
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                if tx.is_open() {
                    log::debug!("Rolling back {} after: {:#}", tx.id(), e);
                    tx.rollback().await?;
                }
                Err(Failure {
                    error: e,
                    committed: tx.state() == TransactionState::Committed,
                })
            }
        }
    }
}

/// Failed attempt of a managed transaction.
struct Failure {
    error: SessionError,
    /// The application committed before failing.
    committed: bool,
}

impl From<SessionError> for Failure {
    fn from(error: SessionError) -> Self {
        Self {
            error,
            committed: false,
        }
    }
}
