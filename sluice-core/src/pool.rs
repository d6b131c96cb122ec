use crate::{Connection, Driver, PoolConfig, Result, SessionError, lock_unpoisoned};
use std::{
    fmt::{self, Debug, Formatter},
    mem,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::Notify,
    time::{Instant, timeout_at},
};

/// Bound of the liveness probe run on every check in.
const CHECK_IN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Snapshot of the pool counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, including those being opened.
    pub size: usize,
    pub checked_out: usize,
    pub idle: usize,
    /// Connections open beyond `max_size`.
    pub overflow: usize,
    pub peak_checked_out: usize,
    pub opened: u64,
    pub closed: u64,
    pub recycled: u64,
    pub timeouts: u64,
}

struct Entry<C> {
    id: u64,
    connection: C,
    created_at: Instant,
    last_used: Instant,
}

struct PoolState<C> {
    /// Stack of idle connections, the most recently used on top.
    idle: Vec<Entry<C>>,
    open: usize,
    checked_out: usize,
    draining: bool,
    peak_checked_out: usize,
    opened: u64,
    closed: u64,
    recycled: u64,
    timeouts: u64,
}

impl<C> PoolState<C> {
    fn check_out(&mut self) {
        self.checked_out += 1;
        self.peak_checked_out = self.peak_checked_out.max(self.checked_out);
    }
}

struct Shared<D: Driver> {
    driver: D,
    url: String,
    config: PoolConfig,
    state: Mutex<PoolState<D::Connection>>,
    /// A connection went idle or a slot was freed.
    available: Notify,
    /// A checked out connection came back.
    returned: Notify,
    next_connection: AtomicU64,
    next_transaction: AtomicU64,
}

enum Checkout<C> {
    Idle(Entry<C>),
    Open,
    Wait,
}

/// Bounded set of reusable connections.
///
/// At most `max_size + max_overflow` connections are open at any time, callers beyond that
/// wait up to their timeout for one to be returned. The pool is a cheap handle, clones share
/// the same connections.
pub struct ConnectionPool<D: Driver> {
    shared: Arc<Shared<D>>,
}

impl<D: Driver> Clone for ConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Driver> Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("driver", &D::NAME)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<D: Driver> ConnectionPool<D> {
    /// Create the pool and open `min_idle` connections.
    pub async fn connect(driver: D, url: impl Into<String>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let warm = config.min_idle;
        let pool = Self {
            shared: Arc::new(Shared {
                driver,
                url: url.into(),
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(config.max_size),
                    open: 0,
                    checked_out: 0,
                    draining: false,
                    peak_checked_out: 0,
                    opened: 0,
                    closed: 0,
                    recycled: 0,
                    timeouts: 0,
                }),
                config,
                available: Notify::new(),
                returned: Notify::new(),
                next_connection: AtomicU64::new(0),
                next_transaction: AtomicU64::new(0),
            }),
        };
        let deadline = Instant::now() + pool.shared.config.acquire_timeout;
        for _ in 0..warm {
            let entry = pool.open(deadline, pool.shared.config.acquire_timeout).await?;
            let mut state = lock_unpoisoned(&pool.shared.state);
            state.open += 1;
            state.idle.push(entry);
        }
        log::debug!(
            "Pool for `{}` started with {} idle connections",
            D::NAME,
            warm
        );
        Ok(pool)
    }

    pub fn driver(&self) -> &D {
        &self.shared.driver
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a connection, waiting at most `timeout` for one to be available.
    ///
    /// Opening a new connection counts against the same timeout. If the returned future is
    /// dropped before completing, the slot it reserved is given back.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<D>> {
        let deadline = Instant::now() + timeout;
        let shared = &self.shared;
        loop {
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let checkout = {
                let mut state = lock_unpoisoned(&shared.state);
                if state.draining {
                    return Err(SessionError::PoolClosed);
                }
                if let Some(entry) = state.idle.pop() {
                    state.check_out();
                    Checkout::Idle(entry)
                } else if state.open < shared.config.capacity() {
                    state.open += 1;
                    state.check_out();
                    Checkout::Open
                } else {
                    Checkout::Wait
                }
            };
            match checkout {
                Checkout::Idle(mut entry) => {
                    let slot = Slot::new(shared.clone());
                    if self.is_expired(&entry) {
                        log::debug!("Recycling connection {} on checkout", entry.id);
                        lock_unpoisoned(&shared.state).recycled += 1;
                    } else if !shared.config.pre_ping
                        || timeout_at(deadline, entry.connection.probe_liveness())
                            .await
                            .unwrap_or(false)
                    {
                        return Ok(PooledConnection::new(entry, slot));
                    } else {
                        log::warn!("Connection {} failed the liveness probe", entry.id);
                    }
                    slot.close_entry(entry).await;
                    let entry = self.open(deadline, timeout).await.inspect_err(|e| {
                        if matches!(e, SessionError::PoolTimeout(..)) {
                            lock_unpoisoned(&shared.state).timeouts += 1;
                        }
                    })?;
                    return Ok(PooledConnection::new(entry, slot));
                }
                Checkout::Open => {
                    let slot = Slot::new(shared.clone());
                    let entry = self.open(deadline, timeout).await.inspect_err(|e| {
                        if matches!(e, SessionError::PoolTimeout(..)) {
                            lock_unpoisoned(&shared.state).timeouts += 1;
                        }
                    })?;
                    return Ok(PooledConnection::new(entry, slot));
                }
                Checkout::Wait => {
                    if timeout_at(deadline, notified).await.is_err() {
                        let stats = {
                            let mut state = lock_unpoisoned(&shared.state);
                            state.timeouts += 1;
                            state.open
                        };
                        log::warn!(
                            "No connection available within {:?} ({} open)",
                            timeout,
                            stats
                        );
                        return Err(SessionError::PoolTimeout(timeout));
                    }
                }
            }
        }
    }

    /// Return a connection to the pool, same as dropping it but completes the check in before
    /// returning.
    pub async fn release(&self, connection: PooledConnection<D>) {
        connection.release().await
    }

    /// Stop handing out connections and close all of them.
    ///
    /// Idle connections are closed immediately, checked out ones when they come back. Fails
    /// with [`SessionError::DrainTimeout`] if some are still out after `shutdown_timeout`.
    pub async fn drain(&self) -> Result<()> {
        let shared = &self.shared;
        let idle = {
            let mut state = lock_unpoisoned(&shared.state);
            state.draining = true;
            mem::take(&mut state.idle)
        };
        shared.available.notify_waiters();
        log::debug!(
            "Draining pool for `{}`, closing {} idle connections",
            D::NAME,
            idle.len()
        );
        let mut result = Ok(());
        for entry in idle {
            {
                let mut state = lock_unpoisoned(&shared.state);
                state.open -= 1;
                state.closed += 1;
            }
            if let Err(e) = entry.connection.close().await {
                log::error!("{:#}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        let timeout = shared.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = shared.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock_unpoisoned(&shared.state).checked_out == 0 {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                let outstanding = lock_unpoisoned(&shared.state).checked_out;
                if outstanding == 0 {
                    break;
                }
                log::warn!(
                    "Pool drain gave up with {} connections still checked out",
                    outstanding
                );
                return Err(SessionError::DrainTimeout {
                    outstanding,
                    timeout,
                });
            }
        }
        result
    }

    pub fn is_draining(&self) -> bool {
        lock_unpoisoned(&self.shared.state).draining
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock_unpoisoned(&self.shared.state);
        PoolStats {
            size: state.open,
            checked_out: state.checked_out,
            idle: state.idle.len(),
            overflow: state.open.saturating_sub(self.shared.config.max_size),
            peak_checked_out: state.peak_checked_out,
            opened: state.opened,
            closed: state.closed,
            recycled: state.recycled,
            timeouts: state.timeouts,
        }
    }

    /// Identifier for a new transaction, unique within this pool.
    pub fn next_transaction_id(&self) -> u64 {
        self.shared.next_transaction.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_expired(&self, entry: &Entry<D::Connection>) -> bool {
        self.shared
            .config
            .pool_recycle
            .is_some_and(|recycle| entry.created_at.elapsed() >= recycle)
    }

    /// Open a physical connection. The caller owns the slot it goes into.
    async fn open(&self, deadline: Instant, timeout: Duration) -> Result<Entry<D::Connection>> {
        let shared = &self.shared;
        let connection = match timeout_at(deadline, shared.driver.connect(&shared.url)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                log::error!("Could not open a `{}` connection: {:#}", D::NAME, e);
                return Err(e);
            }
            Err(..) => {
                log::warn!("Opening a `{}` connection timed out", D::NAME);
                return Err(SessionError::PoolTimeout(timeout));
            }
        };
        let id = shared.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        let open = {
            let mut state = lock_unpoisoned(&shared.state);
            state.opened += 1;
            state.open
        };
        log::debug!("Opened connection {} ({} open)", id, open);
        Ok(Entry {
            id,
            connection,
            created_at: now,
            last_used: now,
        })
    }
}

/// Reservation of one place in the pool. Dropping it frees the place and wakes a waiter.
struct Slot<D: Driver> {
    shared: Arc<Shared<D>>,
    armed: bool,
}

impl<D: Driver> Slot<D> {
    fn new(shared: Arc<Shared<D>>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn pool(&self) -> ConnectionPool<D> {
        ConnectionPool {
            shared: self.shared.clone(),
        }
    }

    /// Close the physical connection, the slot itself stays reserved.
    async fn close_entry(&self, entry: Entry<D::Connection>) {
        lock_unpoisoned(&self.shared.state).closed += 1;
        let id = entry.id;
        if let Err(e) = entry.connection.close().await {
            log::error!("Error while closing connection {}: {:#}", id, e);
        }
    }

    /// Put the connection back into the idle set or close it.
    async fn check_in(mut self, mut entry: Entry<D::Connection>, broken: bool) {
        let pool = self.pool();
        let config = &self.shared.config;
        let expired = pool.is_expired(&entry);
        let alive = !broken
            && !expired
            && tokio::time::timeout(CHECK_IN_PROBE_TIMEOUT, entry.connection.probe_liveness())
                .await
                .unwrap_or(false);
        let reason = {
            let mut state = lock_unpoisoned(&self.shared.state);
            let reason = if state.draining {
                Some("pool draining")
            } else if broken {
                Some("broken")
            } else if expired {
                state.recycled += 1;
                Some("recycled")
            } else if !alive {
                Some("failed liveness probe")
            } else if state.open > config.max_size {
                Some("overflow")
            } else {
                None
            };
            if reason.is_none() {
                entry.last_used = Instant::now();
                state.checked_out -= 1;
                state.idle.push(entry);
                self.armed = false;
                drop(state);
                self.shared.available.notify_one();
                self.shared.returned.notify_waiters();
                return;
            }
            reason
        };
        log::debug!(
            "Closing connection {} on check in: {}",
            entry.id,
            reason.unwrap_or_default()
        );
        self.close_entry(entry).await;
    }
}

impl<D: Driver> Drop for Slot<D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.open -= 1;
            state.checked_out -= 1;
        }
        self.shared.available.notify_one();
        self.shared.returned.notify_waiters();
    }
}

/// A connection checked out of the pool.
///
/// It goes back to the pool with [`PooledConnection::release`] or, when dropped, through a
/// task spawned on the current runtime.
pub struct PooledConnection<D: Driver> {
    entry: Option<Entry<D::Connection>>,
    slot: Option<Slot<D>>,
    broken: bool,
}

impl<D: Driver> PooledConnection<D> {
    fn new(mut entry: Entry<D::Connection>, slot: Slot<D>) -> Self {
        entry.last_used = Instant::now();
        Self {
            entry: Some(entry),
            slot: Some(slot),
            broken: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.entry.as_ref().map_or(0, |v| v.id)
    }

    pub fn get_mut(&mut self) -> Result<&mut D::Connection> {
        self.entry
            .as_mut()
            .map(|v| &mut v.connection)
            .ok_or_else(|| SessionError::invalid_state("The connection was already released"))
    }

    /// The connection will be closed instead of reused.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub(crate) fn clear_broken(&mut self) {
        self.broken = false;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn age(&self) -> Duration {
        self.entry
            .as_ref()
            .map_or(Duration::ZERO, |v| v.created_at.elapsed())
    }

    pub fn pool(&self) -> Option<ConnectionPool<D>> {
        self.slot.as_ref().map(Slot::pool)
    }

    /// Give the connection back to the pool.
    pub async fn release(mut self) {
        if let (Some(entry), Some(slot)) = (self.entry.take(), self.slot.take()) {
            slot.check_in(entry, self.broken).await;
        }
    }
}

impl<D: Driver> Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("broken", &self.broken)
            .finish()
    }
}

impl<D: Driver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        let (Some(entry), Some(slot)) = (self.entry.take(), self.slot.take()) else {
            return;
        };
        let broken = self.broken;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(slot.check_in(entry, broken));
            }
            Err(..) => {
                log::warn!(
                    "Connection {} dropped outside of a tokio runtime, discarding it",
                    entry.id
                );
                lock_unpoisoned(&slot.shared.state).closed += 1;
                drop(entry);
            }
        }
    }
}
