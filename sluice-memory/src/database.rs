use crate::{
    Fault, MemoryConnection,
    faults::Faults,
    locks::{Acquire, LockTable},
};
use anyhow::anyhow;
use sluice_core::{
    EntityKey, Fields, Filter, GenericSqlWriter, IsolationLevel, LockMode, Record, Result, RowSet,
    SessionError, Statement, lock_unpoisoned,
};
use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{Instant, timeout_at},
};

#[derive(Debug, Clone)]
struct Data {
    version: u64,
    fields: Fields,
}

/// A committed state of a row, `None` once deleted.
#[derive(Debug)]
struct Committed {
    at: u64,
    data: Option<Data>,
}

/// Uncommitted write, only the transaction holding the row lock can have one.
#[derive(Debug, Clone)]
struct Pending {
    transaction: u64,
    data: Option<Data>,
}

#[derive(Default, Debug)]
struct Row {
    versions: Vec<Committed>,
    pending: Option<Pending>,
}

impl Row {
    fn own_pending(&self, transaction: u64) -> Option<&Pending> {
        self.pending
            .as_ref()
            .filter(|v| v.transaction == transaction)
    }

    fn latest(&self) -> Option<&Data> {
        self.versions.last().and_then(|v| v.data.as_ref())
    }

    /// What `transaction` reads: its own write, else the committed state as of `snapshot`
    /// (or the latest one when reading committed data).
    fn visible(&self, transaction: u64, snapshot: Option<u64>) -> Option<&Data> {
        if let Some(pending) = self.own_pending(transaction) {
            return pending.data.as_ref();
        }
        match snapshot {
            Some(snapshot) => self
                .versions
                .iter()
                .rev()
                .find(|v| v.at <= snapshot)
                .and_then(|v| v.data.as_ref()),
            None => self.latest(),
        }
    }

    /// The state a write applies to: own write, else latest committed.
    fn current(&self, transaction: u64) -> Option<&Data> {
        match self.own_pending(transaction) {
            Some(pending) => pending.data.as_ref(),
            None => self.latest(),
        }
    }

    fn committed_after(&self, snapshot: u64) -> bool {
        self.versions.last().is_some_and(|v| v.at > snapshot)
    }
}

#[derive(Debug)]
struct Undo {
    key: EntityKey,
    previous: Option<Pending>,
}

#[derive(Debug)]
struct Mark {
    name: String,
    undo: usize,
    locks: usize,
}

#[derive(Debug)]
struct Active {
    connection: u64,
    isolation: IsolationLevel,
    snapshot: u64,
    undo: Vec<Undo>,
    /// Row locks in acquisition order.
    locked: Vec<EntityKey>,
    savepoints: Vec<Mark>,
    reads: HashSet<EntityKey>,
    scans: HashSet<String>,
}

impl Active {
    fn snapshot(&self) -> Option<u64> {
        match self.isolation {
            IsolationLevel::ReadCommitted => None,
            _ => Some(self.snapshot),
        }
    }

    /// Writes and locking reads of rows committed after the snapshot fail in snapshot levels.
    fn check_concurrent_update(&self, transaction: u64, key: &EntityKey, row: &Row) -> Result<()> {
        if self.isolation != IsolationLevel::ReadCommitted
            && row.own_pending(transaction).is_none()
            && row.committed_after(self.snapshot)
        {
            return Err(SessionError::SerializationConflict(format!(
                "could not serialize access due to concurrent update of {}",
                key
            )));
        }
        Ok(())
    }
}

#[derive(Default, Debug)]
struct State {
    tables: BTreeMap<String, BTreeMap<i64, Row>>,
    /// Last commit that wrote each table.
    table_commits: HashMap<String, u64>,
    clock: u64,
    next_transaction: u64,
    active: HashMap<u64, Active>,
    locks: LockTable,
}

fn terminated(transaction: u64) -> SessionError {
    SessionError::disconnected(anyhow!(
        "transaction {} was terminated by the server",
        transaction
    ))
}

fn record(table: &str, id: i64, data: &Data) -> Record {
    Record {
        key: EntityKey::new(table.to_owned(), id),
        version: data.version,
        fields: data.fields.clone(),
    }
}

impl State {
    fn begin(&mut self, connection: u64, isolation: IsolationLevel) -> u64 {
        self.next_transaction += 1;
        let transaction = self.next_transaction;
        self.active.insert(
            transaction,
            Active {
                connection,
                isolation,
                snapshot: self.clock,
                undo: Vec::new(),
                locked: Vec::new(),
                savepoints: Vec::new(),
                reads: HashSet::new(),
                scans: HashSet::new(),
            },
        );
        transaction
    }

    fn active(&mut self, transaction: u64) -> Result<&mut Active> {
        self.active
            .get_mut(&transaction)
            .ok_or_else(|| terminated(transaction))
    }

    fn row_mut(&mut self, key: &EntityKey) -> Option<&mut Row> {
        self.tables.get_mut(&*key.table)?.get_mut(&key.id)
    }

    fn sees(&mut self, transaction: u64, key: &EntityKey) -> Result<bool> {
        let snapshot = self.active(transaction)?.snapshot();
        Ok(self
            .tables
            .get(&*key.table)
            .and_then(|v| v.get(&key.id))
            .and_then(|v| v.visible(transaction, snapshot))
            .is_some())
    }

    fn insert(&mut self, transaction: u64, key: EntityKey, fields: Fields) -> Result<RowSet> {
        let active = self
            .active
            .get_mut(&transaction)
            .ok_or_else(|| terminated(transaction))?;
        let row = self
            .tables
            .entry(key.table.to_string())
            .or_default()
            .entry(key.id)
            .or_default();
        if row.current(transaction).is_some() {
            return Err(SessionError::driver(anyhow!(
                "duplicate key value violates unique constraint, {} already exists",
                key
            )));
        }
        active.check_concurrent_update(transaction, &key, row)?;
        let data = Data { version: 1, fields };
        let result = record(&key.table, key.id, &data);
        let previous = row.pending.replace(Pending {
            transaction,
            data: Some(data),
        });
        active.undo.push(Undo { key, previous });
        Ok(RowSet::affected(vec![result]))
    }

    /// Update (`fields` is `Some`) or delete a row this transaction holds the lock of.
    fn write(
        &mut self,
        transaction: u64,
        key: &EntityKey,
        fields: Option<&Fields>,
        expected_version: Option<u64>,
    ) -> Result<RowSet> {
        let active = self
            .active
            .get_mut(&transaction)
            .ok_or_else(|| terminated(transaction))?;
        let Some(row) = self
            .tables
            .get_mut(&*key.table)
            .and_then(|v| v.get_mut(&key.id))
        else {
            return Ok(RowSet::default());
        };
        active.check_concurrent_update(transaction, key, row)?;
        let Some(current) = row.current(transaction).cloned() else {
            return Ok(RowSet::default());
        };
        if expected_version.is_some_and(|v| v != current.version) {
            return Ok(RowSet::default());
        }
        let (data, returned) = match fields {
            Some(fields) => {
                let mut merged = current.fields;
                merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                let data = Data {
                    version: current.version + 1,
                    fields: merged,
                };
                let returned = record(&key.table, key.id, &data);
                (Some(data), returned)
            }
            None => (None, record(&key.table, key.id, &current)),
        };
        let previous = row.pending.replace(Pending { transaction, data });
        active.undo.push(Undo {
            key: key.clone(),
            previous,
        });
        Ok(RowSet::affected(vec![returned]))
    }

    fn select(
        &mut self,
        transaction: u64,
        table: &str,
        filter: &Filter,
        limit: Option<u32>,
    ) -> Result<RowSet> {
        let active = self
            .active
            .get_mut(&transaction)
            .ok_or_else(|| terminated(transaction))?;
        let snapshot = active.snapshot();
        if active.isolation == IsolationLevel::Serializable {
            match filter {
                Filter::Ids(ids) => active.reads.extend(
                    ids.iter()
                        .map(|id| EntityKey::new(table.to_owned(), *id)),
                ),
                _ => {
                    active.scans.insert(table.to_owned());
                }
            }
        }
        let Some(rows) = self.tables.get(table) else {
            return Ok(RowSet::default());
        };
        let limit = limit.map_or(usize::MAX, |v| v as usize);
        let result = candidates(rows, filter)
            .filter_map(|(id, row)| {
                row.visible(transaction, snapshot)
                    .filter(|data| filter.matches(id, &data.fields))
                    .map(|data| record(table, id, data))
            })
            .take(limit)
            .collect();
        Ok(RowSet::affected(result))
    }

    /// Ids a locking read will try to lock, in id order.
    fn lock_candidates(
        &mut self,
        transaction: u64,
        table: &str,
        filter: &Filter,
    ) -> Result<Vec<i64>> {
        let snapshot = self.active(transaction)?.snapshot();
        let Some(rows) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(candidates(rows, filter)
            .filter(|(id, row)| {
                row.visible(transaction, snapshot)
                    .is_some_and(|data| filter.matches(*id, &data.fields))
            })
            .map(|(id, _)| id)
            .collect())
    }

    /// Re-read a row after its lock was granted.
    fn locked_read(
        &mut self,
        transaction: u64,
        key: &EntityKey,
        filter: &Filter,
    ) -> Result<Option<Record>> {
        let active = self
            .active
            .get_mut(&transaction)
            .ok_or_else(|| terminated(transaction))?;
        let Some(row) = self
            .tables
            .get(&*key.table)
            .and_then(|v| v.get(&key.id))
        else {
            return Ok(None);
        };
        active.check_concurrent_update(transaction, key, row)?;
        if active.isolation == IsolationLevel::Serializable {
            active.reads.insert(key.clone());
        }
        Ok(row
            .current(transaction)
            .filter(|data| filter.matches(key.id, &data.fields))
            .map(|data| record(&key.table, key.id, data)))
    }

    /// Serializable transactions fail if something they read changed since their snapshot.
    fn validate(&self, active: &Active) -> std::result::Result<(), String> {
        for key in &active.reads {
            if self
                .tables
                .get(&*key.table)
                .and_then(|v| v.get(&key.id))
                .is_some_and(|row| row.committed_after(active.snapshot))
            {
                return Err(format!(
                    "could not serialize access, {} was modified by a concurrent transaction",
                    key
                ));
            }
        }
        for table in &active.scans {
            if self
                .table_commits
                .get(table)
                .is_some_and(|v| *v > active.snapshot)
            {
                return Err(format!(
                    "could not serialize access, table `{}` was modified by a concurrent transaction",
                    table
                ));
            }
        }
        Ok(())
    }

    fn commit(&mut self, transaction: u64) -> Result<()> {
        let active = self
            .active
            .remove(&transaction)
            .ok_or_else(|| terminated(transaction))?;
        if active.isolation == IsolationLevel::Serializable
            && let Err(reason) = self.validate(&active)
        {
            self.undo(transaction, active);
            return Err(SessionError::SerializationConflict(reason));
        }
        self.clock += 1;
        let at = self.clock;
        for Undo { key, .. } in &active.undo {
            let Some(row) = self
                .tables
                .get_mut(&*key.table)
                .and_then(|v| v.get_mut(&key.id))
            else {
                continue;
            };
            if let Some(pending) = row.pending.take_if(|v| v.transaction == transaction) {
                row.versions.push(Committed {
                    at,
                    data: pending.data,
                });
                self.table_commits.insert(key.table.to_string(), at);
            }
        }
        self.locks.release_all(transaction);
        self.prune(active.undo.iter().map(|v| &v.key));
        Ok(())
    }

    fn undo(&mut self, transaction: u64, active: Active) {
        self.revert(active.undo.iter().rev());
        self.locks.release_all(transaction);
        self.prune(active.undo.iter().map(|v| &v.key));
    }

    fn revert<'a>(&mut self, entries: impl Iterator<Item = &'a Undo>) {
        for Undo { key, previous } in entries {
            if let Some(row) = self.row_mut(key) {
                row.pending = previous.clone();
            }
        }
    }

    fn rollback(&mut self, transaction: u64) -> bool {
        match self.active.remove(&transaction) {
            Some(active) => {
                self.undo(transaction, active);
                true
            }
            None => false,
        }
    }

    fn rollback_to(&mut self, transaction: u64, name: &str) -> Result<()> {
        let active = self.active(transaction)?;
        let Some(position) = active.savepoints.iter().rposition(|v| v.name == name) else {
            return Err(missing_savepoint(name));
        };
        active.savepoints.truncate(position + 1);
        let (undo, locks) = (
            active.savepoints[position].undo,
            active.savepoints[position].locks,
        );
        let undone: Vec<Undo> = active.undo.drain(undo..).collect();
        let released: Vec<EntityKey> = active.locked.drain(locks..).collect();
        self.revert(undone.iter().rev());
        for key in &released {
            self.locks.release(key, transaction);
        }
        self.prune(undone.iter().map(|v| &v.key));
        Ok(())
    }

    /// Drop versions no active snapshot can see anymore.
    fn prune<'a>(&mut self, keys: impl Iterator<Item = &'a EntityKey>) {
        let horizon = self
            .active
            .values()
            .map(|v| v.snapshot)
            .min()
            .unwrap_or(self.clock);
        for key in keys {
            let Some(rows) = self.tables.get_mut(&*key.table) else {
                continue;
            };
            let Some(row) = rows.get_mut(&key.id) else {
                continue;
            };
            if let Some(keep) = row.versions.iter().rposition(|v| v.at <= horizon) {
                row.versions.drain(..keep);
            }
            let gone = row.pending.is_none()
                && match row.versions.as_slice() {
                    [] => true,
                    [only] => only.data.is_none() && only.at <= horizon,
                    _ => false,
                };
            if gone {
                rows.remove(&key.id);
            }
        }
    }
}

fn candidates<'r>(
    rows: &'r BTreeMap<i64, Row>,
    filter: &Filter,
) -> Box<dyn Iterator<Item = (i64, &'r Row)> + 'r> {
    match filter {
        Filter::Ids(ids) => {
            let mut ids = ids.clone();
            ids.sort_unstable();
            ids.dedup();
            Box::new(
                ids.into_iter()
                    .filter_map(move |id| rows.get(&id).map(|row| (id, row))),
            )
        }
        _ => Box::new(rows.iter().map(|(id, row)| (*id, row))),
    }
}

fn missing_savepoint(name: &str) -> SessionError {
    SessionError::driver(anyhow!("savepoint \"{}\" does not exist", name))
}

/// Removes the wait-for edge when a lock wait ends, however it ends.
struct WaitGuard<'d> {
    database: &'d MemoryDatabase,
    transaction: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.database.state().locks.stop_waiting(self.transaction);
    }
}

/// In-process storage engine shared by every connection of a `MemoryDriver`.
///
/// Rows are versioned (MVCC): readers never block, writers take an exclusive row lock held
/// until the end of their transaction. Read committed sees the latest committed state at each
/// statement, repeatable read and serializable see the state as of the start of the
/// transaction and fail with a serialization conflict when writing a row committed after it.
/// Serializable transactions additionally validate at commit that nothing they read changed.
///
/// The database also exposes fault injection and introspection for tests.
#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
    /// Some row lock was released.
    released: Notify,
    faults: Mutex<Faults>,
    journal: Mutex<Option<Vec<String>>>,
    writer: GenericSqlWriter,
    epoch: AtomicU64,
    open_connections: AtomicUsize,
    connections_opened: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock_unpoisoned(&self.state)
    }

    pub(crate) fn faults(&self) -> MutexGuard<'_, Faults> {
        lock_unpoisoned(&self.faults)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn open(self: &Arc<Self>) -> Result<MemoryConnection> {
        if self.faults().take_connection_refusal() {
            log::warn!("Memory database refused a connection (injected)");
            return Err(SessionError::disconnected(anyhow!(
                "could not connect to server: connection refused"
            )));
        }
        let id = self.connections_opened.fetch_add(1, Ordering::Relaxed) + 1;
        self.open_connections.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryConnection::new(self.clone(), id, self.epoch()))
    }

    pub(crate) fn connection_closed(&self) {
        self.open_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn journal_with(&self, f: impl FnOnce(&GenericSqlWriter, &mut String)) {
        if let Some(journal) = lock_unpoisoned(&self.journal).as_mut() {
            let mut out = String::new();
            f(&self.writer, &mut out);
            journal.push(out);
        }
    }

    pub(crate) fn begin(&self, connection: u64, isolation: IsolationLevel) -> u64 {
        self.state().begin(connection, isolation)
    }

    pub(crate) fn commit(&self, transaction: u64) -> Result<()> {
        let result = self.state().commit(transaction);
        self.released.notify_waiters();
        result
    }

    pub(crate) fn rollback(&self, transaction: u64) {
        if self.state().rollback(transaction) {
            self.released.notify_waiters();
        }
    }

    pub(crate) fn savepoint(&self, transaction: u64, name: &str) -> Result<()> {
        let mut state = self.state();
        let active = state.active(transaction)?;
        active.savepoints.push(Mark {
            name: name.to_owned(),
            undo: active.undo.len(),
            locks: active.locked.len(),
        });
        Ok(())
    }

    pub(crate) fn release_savepoint(&self, transaction: u64, name: &str) -> Result<()> {
        let mut state = self.state();
        let active = state.active(transaction)?;
        let Some(position) = active.savepoints.iter().rposition(|v| v.name == name) else {
            return Err(missing_savepoint(name));
        };
        active.savepoints.truncate(position);
        Ok(())
    }

    pub(crate) fn rollback_to_savepoint(&self, transaction: u64, name: &str) -> Result<()> {
        let result = self.state().rollback_to(transaction, name);
        self.released.notify_waiters();
        result
    }

    pub(crate) async fn execute(
        &self,
        transaction: u64,
        statement: &Statement,
        timeout: Option<Duration>,
    ) -> Result<RowSet> {
        match statement {
            Statement::Insert { table, id, fields } => {
                let key = EntityKey::new(table.clone(), *id);
                self.lock_row(transaction, &key, LockMode::Wait, timeout)
                    .await?;
                self.state().insert(transaction, key, fields.clone())
            }
            Statement::Select {
                table,
                filter,
                limit,
                lock: None,
            } => self.state().select(transaction, table, filter, *limit),
            Statement::Select {
                table,
                filter,
                limit,
                lock: Some(mode),
            } => {
                self.select_for_update(transaction, table, filter, *limit, *mode, timeout)
                    .await
            }
            Statement::Update {
                table,
                id,
                fields,
                expected_version,
            } => {
                let key = EntityKey::new(table.clone(), *id);
                self.write(transaction, &key, Some(fields), *expected_version, timeout)
                    .await
            }
            Statement::Delete {
                table,
                id,
                expected_version,
            } => {
                let key = EntityKey::new(table.clone(), *id);
                self.write(transaction, &key, None, *expected_version, timeout)
                    .await
            }
        }
    }

    async fn write(
        &self,
        transaction: u64,
        key: &EntityKey,
        fields: Option<&Fields>,
        expected_version: Option<u64>,
        timeout: Option<Duration>,
    ) -> Result<RowSet> {
        let visible = self.state().sees(transaction, key)?;
        if !visible {
            return Ok(RowSet::default());
        }
        self.lock_row(transaction, key, LockMode::Wait, timeout)
            .await?;
        self.state()
            .write(transaction, key, fields, expected_version)
    }

    async fn select_for_update(
        &self,
        transaction: u64,
        table: &Cow<'static, str>,
        filter: &Filter,
        limit: Option<u32>,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<RowSet> {
        let candidates = self.state().lock_candidates(transaction, table, filter)?;
        let limit = limit.map_or(usize::MAX, |v| v as usize);
        let mut rows = Vec::new();
        for id in candidates {
            if rows.len() >= limit {
                break;
            }
            let key = EntityKey::new(table.clone(), id);
            if !self.lock_row(transaction, &key, mode, timeout).await? {
                continue;
            }
            let record = self.state().locked_read(transaction, &key, filter)?;
            rows.extend(record);
        }
        Ok(RowSet::affected(rows))
    }

    /// Take the row lock. `false` when skipped in `SkipLocked` mode.
    async fn lock_row(
        &self,
        transaction: u64,
        key: &EntityKey,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let deadline = timeout.map(|v| Instant::now() + v);
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                let State { locks, active, .. } = &mut *state;
                let Some(active) = active.get_mut(&transaction) else {
                    return Err(terminated(transaction));
                };
                match locks.try_acquire(key, transaction) {
                    Acquire::Granted => {
                        locks.stop_waiting(transaction);
                        if !active.locked.contains(key) {
                            active.locked.push(key.clone());
                        }
                        return Ok(true);
                    }
                    Acquire::Busy(holder) => match mode {
                        LockMode::NoWait => return Err(SessionError::RowLocked(key.clone())),
                        LockMode::SkipLocked => return Ok(false),
                        LockMode::Wait => {
                            if let Err(cycle) = locks.wait_for(transaction, key) {
                                let message = format!(
                                    "transaction {} waits for {} held by transaction {}, wait cycle {:?}",
                                    transaction, key, holder, cycle
                                );
                                log::warn!("Deadlock detected: {}", message);
                                return Err(SessionError::DeadlockDetected(message));
                            }
                        }
                    },
                }
            }
            let _waiting = WaitGuard {
                database: self,
                transaction,
            };
            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return Err(SessionError::LockTimeout {
                            key: key.clone(),
                            timeout,
                        });
                    }
                }
                _ => notified.await,
            }
        }
    }

    /// Drop every connection: their transactions are rolled back and every further operation
    /// on them fails with a lost connection error.
    pub fn kill_connections(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let killed = {
            let mut state = self.state();
            let transactions: Vec<u64> = state.active.keys().copied().collect();
            for transaction in &transactions {
                state.rollback(*transaction);
            }
            transactions.len()
        };
        self.released.notify_waiters();
        log::warn!(
            "Killed all connections, {} transactions rolled back",
            killed
        );
        killed
    }

    /// The next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.faults().refused_connections += count;
    }

    /// The next `count` statements, on any connection, fail with `fault`.
    pub fn fail_next_statements(&self, fault: Fault, count: usize) {
        if count > 0 {
            self.faults().statements.push((fault, count));
        }
    }

    /// The next `count` commits lose the connection before the commit is applied.
    pub fn fail_next_commits(&self, count: usize) {
        self.faults().commits += count;
    }

    /// The next `count` liveness probes report a dead connection.
    pub fn fail_liveness_probes(&self, count: usize) {
        self.faults().probes += count;
    }

    /// Start recording every operation as SQL text.
    pub fn enable_journal(&self) {
        lock_unpoisoned(&self.journal).get_or_insert_with(Vec::new);
    }

    /// Recorded operations, the journal is emptied.
    pub fn take_journal(&self) -> Vec<String> {
        lock_unpoisoned(&self.journal)
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Acquire)
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    pub fn active_transactions(&self) -> usize {
        self.state().active.len()
    }

    /// Transactions currently open by a connection.
    pub fn transactions_of(&self, connection: u64) -> usize {
        self.state()
            .active
            .values()
            .filter(|v| v.connection == connection)
            .count()
    }

    pub fn locks_held(&self) -> usize {
        self.state().locks.held()
    }

    /// Latest committed state of a row.
    pub fn row(&self, table: &str, id: i64) -> Option<Record> {
        self.state()
            .tables
            .get(table)?
            .get(&id)?
            .latest()
            .map(|data| record(table, id, data))
    }

    /// Latest committed rows of a table, in id order.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state()
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|(id, row)| row.latest().map(|data| record(table, *id, data)))
                    .collect()
            })
            .unwrap_or_default()
    }
}
