use crate::{
    Connection, Driver, EntityKey, Fields, Filter, PooledConnection, Record, Result, RowSet,
    SessionError, Statement, truncate_long,
};
use anyhow::anyhow;
use futures::future::BoxFuture;
use std::{
    borrow::Cow,
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    str::FromStr,
    time::Duration,
};
use tokio::{
    runtime::Handle,
    time::{Instant, timeout_at},
};

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl Display for IsolationLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::RepeatableRead => "repeatable-read",
            IsolationLevel::Serializable => "serializable",
        })
    }
}

impl FromStr for IsolationLevel {
    type Err = SessionError;

    /// Accepts `read-committed`, `READ COMMITTED`, `read_committed` and the like.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s
            .split(|c: char| c == '-' || c == '_' || c.is_whitespace())
            .filter(|v| !v.is_empty())
            .map(str::to_ascii_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        match normalized.as_str() {
            "read committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(SessionError::Config(anyhow!(
                "Unknown isolation level `{}`",
                s
            ))),
        }
    }
}

/// Settings handed to the driver when a transaction starts.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    /// Bound on a single lock wait.
    pub statement_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Public view of one open savepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    /// Position in the savepoint stack, 1 for the outermost one.
    pub depth: usize,
}

struct Marker {
    name: String,
    /// Locks registered before the savepoint was created.
    locks: usize,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

async fn within<T>(deadline: Option<Deadline>, future: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some(deadline) => timeout_at(deadline.at, future)
            .await
            .unwrap_or_else(|_| Err(SessionError::TransactionTimeout(deadline.timeout))),
        None => future.await,
    }
}

/// A database transaction bound to one pooled connection.
///
/// The context is either open, committed or rolled back. Committing or rolling back gives the
/// connection back to the pool. Dropping a context that is still open rolls it back on a
/// background task, so a cancelled caller never leaks a transaction.
pub struct TransactionContext<D: Driver> {
    id: TransactionId,
    connection: Option<PooledConnection<D>>,
    options: TransactionOptions,
    state: TransactionState,
    savepoints: Vec<Marker>,
    savepoint_counter: u32,
    locks: Vec<EntityKey>,
    deadline: Option<Deadline>,
}

impl<D: Driver> TransactionContext<D> {
    /// Start a transaction on the connection.
    ///
    /// With a `timeout` every operation of the context must complete before it expires,
    /// otherwise it fails with [`SessionError::TransactionTimeout`].
    pub async fn begin(
        mut connection: PooledConnection<D>,
        options: TransactionOptions,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let id = TransactionId(connection.pool().map_or(0, |v| v.next_transaction_id()));
        let deadline = timeout.map(|timeout| Deadline {
            at: Instant::now() + timeout,
            timeout,
        });
        let result = match connection.get_mut() {
            Ok(c) => within(deadline, c.begin(&options)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::error!("Could not begin transaction {}: {:#}", id, e);
            if e.is_disconnect() || matches!(e, SessionError::TransactionTimeout(..)) {
                connection.mark_broken();
            }
            connection.release().await;
            return Err(e);
        }
        log::debug!(
            "Began {} ({}) on connection {}",
            id,
            options.isolation,
            connection.id()
        );
        Ok(Self {
            id,
            connection: Some(connection),
            options,
            state: TransactionState::Open,
            savepoints: Vec::new(),
            savepoint_counter: 0,
            locks: Vec::new(),
            deadline,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.options.isolation
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(PooledConnection::id)
    }

    /// Instant after which operations fail with `TransactionTimeout`.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|v| v.at)
    }

    /// Open savepoints, outermost first.
    pub fn savepoints(&self) -> Vec<Savepoint> {
        self.savepoints
            .iter()
            .enumerate()
            .map(|(i, v)| Savepoint {
                name: v.name.clone(),
                depth: i + 1,
            })
            .collect()
    }

    pub fn depth(&self) -> usize {
        self.savepoints.len()
    }

    /// Rows locked by this context, either locked for update or written, in the order the
    /// locks were taken. Rolling back to a savepoint forgets the ones taken after it.
    pub fn locks(&self) -> &[EntityKey] {
        &self.locks
    }

    pub fn holds_lock(&self, key: &EntityKey) -> bool {
        self.locks.contains(key)
    }

    pub(crate) fn register_lock(&mut self, key: EntityKey) {
        if !self.locks.contains(&key) {
            self.locks.push(key);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            TransactionState::Committed => Err(SessionError::invalid_state(format!(
                "Transaction {} is already committed",
                self.id
            ))),
            TransactionState::RolledBack => Err(SessionError::invalid_state(format!(
                "Transaction {} is already rolled back",
                self.id
            ))),
        }
    }

    fn connection_mut(&mut self) -> Result<&mut D::Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| SessionError::invalid_state("The transaction has no connection"))?
            .get_mut()
    }

    /// A failed operation may leave the connection unusable.
    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && (e.is_disconnect() || matches!(e, SessionError::TransactionTimeout(..)))
            && let Some(connection) = &mut self.connection
        {
            connection.mark_broken();
        }
        result
    }

    pub async fn execute(&mut self, statement: &Statement) -> Result<RowSet> {
        self.ensure_open()?;
        log::trace!("[{}] {}", self.id, truncate_long!(statement.to_string()));
        let deadline = self.deadline;
        let result = match self.connection_mut() {
            Ok(c) => within(deadline, c.execute(statement)).await,
            Err(e) => Err(e),
        };
        let rows = self.observe(result)?;
        // Written rows stay locked until the transaction ends.
        if rows.rows_affected > 0
            && let Some(key) = statement.written_key()
        {
            self.register_lock(key);
        }
        Ok(rows)
    }

    /// Insert a row, returns it with its initial version.
    pub async fn insert(
        &mut self,
        table: impl Into<Cow<'static, str>>,
        id: i64,
        fields: Fields,
    ) -> Result<Record> {
        let statement = Statement::insert(table, id, fields);
        self.execute(&statement).await?.first().ok_or_else(|| {
            SessionError::driver(anyhow!("The insert into `{}` returned no row", statement.table()))
        })
    }

    pub async fn select(
        &mut self,
        table: impl Into<Cow<'static, str>>,
        filter: Filter,
    ) -> Result<Vec<Record>> {
        Ok(self
            .execute(&Statement::select(table).filter(filter))
            .await?
            .rows)
    }

    pub async fn fetch_one(
        &mut self,
        table: impl Into<Cow<'static, str>>,
        id: i64,
    ) -> Result<Option<Record>> {
        Ok(self
            .execute(&Statement::select(table).filter(Filter::Ids(vec![id])))
            .await?
            .first())
    }

    /// Unconditional update, returns the new row or `None` when it does not exist.
    pub async fn update(
        &mut self,
        table: impl Into<Cow<'static, str>>,
        id: i64,
        fields: Fields,
    ) -> Result<Option<Record>> {
        Ok(self
            .execute(&Statement::update(table, id, fields))
            .await?
            .first())
    }

    /// Returns whether the row existed.
    pub async fn delete(&mut self, table: impl Into<Cow<'static, str>>, id: i64) -> Result<bool> {
        Ok(self.execute(&Statement::delete(table, id)).await?.rows_affected > 0)
    }

    pub async fn savepoint(&mut self, name: &str) -> Result<Savepoint> {
        self.ensure_open()?;
        if self.savepoints.iter().any(|v| v.name == name) {
            return Err(SessionError::invalid_state(format!(
                "Savepoint `{}` already exists in {}",
                name, self.id
            )));
        }
        let deadline = self.deadline;
        let result = match self.connection_mut() {
            Ok(c) => within(deadline, c.savepoint(name)).await,
            Err(e) => Err(e),
        };
        self.observe(result)?;
        self.savepoints.push(Marker {
            name: name.to_owned(),
            locks: self.locks.len(),
        });
        log::trace!("[{}] savepoint `{}`", self.id, name);
        Ok(Savepoint {
            name: name.to_owned(),
            depth: self.savepoints.len(),
        })
    }

    fn find_savepoint(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|v| v.name == name)
            .ok_or_else(|| {
                SessionError::invalid_state(format!(
                    "No savepoint named `{}` in {}",
                    name, self.id
                ))
            })
    }

    /// Undo everything done after the savepoint. The savepoint itself stays open, the ones
    /// created after it are discarded.
    pub async fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let position = self.find_savepoint(name)?;
        let deadline = self.deadline;
        let result = match self.connection_mut() {
            Ok(c) => within(deadline, c.rollback_to_savepoint(name)).await,
            Err(e) => Err(e),
        };
        self.observe(result)?;
        self.savepoints.truncate(position + 1);
        let locks = self.savepoints[position].locks;
        self.locks.truncate(locks);
        log::trace!("[{}] rolled back to savepoint `{}`", self.id, name);
        Ok(())
    }

    /// Forget the savepoint and every savepoint created after it, keeping their changes.
    pub async fn release(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let position = self.find_savepoint(name)?;
        let deadline = self.deadline;
        let result = match self.connection_mut() {
            Ok(c) => within(deadline, c.release_savepoint(name)).await,
            Err(e) => Err(e),
        };
        self.observe(result)?;
        self.savepoints.truncate(position);
        Ok(())
    }

    /// Run `work` inside its own savepoint.
    ///
    /// On success the savepoint is released. On error everything `work` did is rolled back,
    /// the error is returned and the enclosing transaction stays usable.
    ///
    /// ```rust,ignore
    /// let result = tx
    ///     .nested(|tx| async move { tx.insert("audit", 7, fields).await }.boxed())
    ///     .await;
    /// ```
    pub async fn nested<T, F>(&mut self, work: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut TransactionContext<D>) -> BoxFuture<'c, Result<T>>,
    {
        self.ensure_open()?;
        self.savepoint_counter += 1;
        let name = format!("sp_{}", self.savepoint_counter);
        self.savepoint(&name).await?;
        let result = work(&mut *self).await;
        let still_open = self.is_open() && self.savepoints.iter().any(|v| v.name == name);
        match result {
            Ok(value) => {
                if still_open {
                    self.release(&name).await?;
                }
                Ok(value)
            }
            Err(e) => {
                log::debug!(
                    "[{}] rolling back to savepoint `{}` after: {:#}",
                    self.id,
                    name,
                    e
                );
                if still_open {
                    let undone = match self.rollback_to(&name).await {
                        Ok(()) => self.release(&name).await,
                        Err(e) => Err(e),
                    };
                    if let Err(undo) = undone {
                        log::error!(
                            "[{}] could not roll back to savepoint `{}`: {:#}",
                            self.id,
                            name,
                            undo
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Make the changes durable and return the connection to the pool.
    ///
    /// Refuses to commit while savepoints are open, the context stays open in that case. A
    /// conflict reported at commit time rolls the transaction back. Losing the connection
    /// while committing fails with [`SessionError::CommitInDoubt`]: the outcome is unknown.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.savepoints.is_empty() {
            return Err(SessionError::invalid_state(format!(
                "Cannot commit {} with {} open savepoints ({})",
                self.id,
                self.savepoints.len(),
                self.savepoints
                    .iter()
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let deadline = self.deadline;
        let result = match self.connection_mut() {
            Ok(c) => within(deadline, c.commit()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.state = TransactionState::Committed;
                self.locks.clear();
                log::debug!("Committed {}", self.id);
                if let Some(connection) = self.connection.take() {
                    connection.release().await;
                }
                Ok(())
            }
            Err(e) if e.is_disconnect() || matches!(e, SessionError::TransactionTimeout(..)) => {
                // Nothing else can be done on this connection, the outcome is unknown.
                self.state = TransactionState::RolledBack;
                self.locks.clear();
                let e = match e {
                    SessionError::Disconnected(e) | SessionError::CommitInDoubt(e) => e,
                    e => anyhow::Error::new(e),
                };
                let e = SessionError::CommitInDoubt(e);
                log::error!("{} {:#}", self.id, e);
                if let Some(mut connection) = self.connection.take() {
                    connection.mark_broken();
                    connection.release().await;
                }
                Err(e)
            }
            Err(e) => {
                log::warn!("Commit of {} failed, rolling back: {:#}", self.id, e);
                self.rollback().await?;
                Err(e)
            }
        }
    }

    /// Discard the changes and return the connection to the pool.
    ///
    /// Never fails on an open context: a rollback the driver cannot perform is logged and the
    /// connection is discarded. Rolling back twice is a no op.
    pub async fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::RolledBack => return Ok(()),
            TransactionState::Committed => return self.ensure_open(),
            TransactionState::Open => {}
        }
        self.state = TransactionState::RolledBack;
        self.savepoints.clear();
        self.locks.clear();
        if let Some(mut connection) = self.connection.take() {
            let result = match connection.get_mut() {
                Ok(c) => c.rollback().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => log::debug!("Rolled back {}", self.id),
                Err(e) => {
                    log::error!("Rollback of {} failed: {:#}", self.id, e);
                    connection.mark_broken();
                }
            }
            connection.release().await;
        }
        Ok(())
    }
}

impl<D: Driver> Debug for TransactionContext<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("isolation", &self.options.isolation)
            .field("connection", &self.connection_id())
            .field("savepoints", &self.depth())
            .finish()
    }
}

impl<D: Driver> Drop for TransactionContext<D> {
    fn drop(&mut self) {
        if self.state != TransactionState::Open {
            return;
        }
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        let id = self.id;
        log::warn!("{} dropped while open, rolling it back", id);
        // Never reused unless the rollback below completes.
        connection.mark_broken();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                let result = match connection.get_mut() {
                    Ok(c) => c.rollback().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => connection.clear_broken(),
                    Err(e) => log::error!("Background rollback of {} failed: {:#}", id, e),
                }
                connection.release().await;
            });
        }
    }
}
