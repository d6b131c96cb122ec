use crate::EntityKey;
use std::time::Duration;
use thiserror::Error;

/// Discriminant of [`SessionError`], used by retry classifiers and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PoolTimeout,
    PoolClosed,
    RowLocked,
    LockTimeout,
    VersionConflict,
    SerializationConflict,
    DeadlockDetected,
    Disconnected,
    Driver,
    TransactionTimeout,
    InvalidState,
    CommitInDoubt,
    RetriesExhausted,
    DrainTimeout,
    Decode,
    Config,
    Application,
}

/// Every failure surfaced by the session layer.
///
/// `VersionConflict` and `RowLocked` are part of the normal flow under contention: the caller
/// re-reads and tries again (or moves on), they do not indicate a broken transaction.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no connection became available within {0:?}")]
    PoolTimeout(Duration),

    #[error("the connection pool is draining and does not hand out connections")]
    PoolClosed,

    #[error("row {0} is locked by another transaction")]
    RowLocked(EntityKey),

    #[error("waited more than {timeout:?} for the lock on row {key}")]
    LockTimeout { key: EntityKey, timeout: Duration },

    #[error("row {key} was modified concurrently, expected version {expected}")]
    VersionConflict { key: EntityKey, expected: u64 },

    #[error("could not serialize access: {0}")]
    SerializationConflict(String),

    #[error("deadlock detected: {0}")]
    DeadlockDetected(String),

    #[error("connection lost: {0:#}")]
    Disconnected(anyhow::Error),

    #[error("driver error: {0:#}")]
    Driver(anyhow::Error),

    #[error("transaction exceeded its deadline of {0:?}")]
    TransactionTimeout(Duration),

    #[error("{0}")]
    InvalidState(String),

    #[error("connection lost while committing, the outcome is unknown: {0:#}")]
    CommitInDoubt(anyhow::Error),

    #[error("gave up after {attempts} attempts, last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SessionError>,
    },

    #[error("{outstanding} connections were still checked out after waiting {timeout:?}")]
    DrainTimeout { outstanding: usize, timeout: Duration },

    #[error("cannot decode {found} as {expected}")]
    Decode {
        expected: &'static str,
        found: String,
    },

    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),

    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::PoolTimeout(..) => ErrorKind::PoolTimeout,
            SessionError::PoolClosed => ErrorKind::PoolClosed,
            SessionError::RowLocked(..) => ErrorKind::RowLocked,
            SessionError::LockTimeout { .. } => ErrorKind::LockTimeout,
            SessionError::VersionConflict { .. } => ErrorKind::VersionConflict,
            SessionError::SerializationConflict(..) => ErrorKind::SerializationConflict,
            SessionError::DeadlockDetected(..) => ErrorKind::DeadlockDetected,
            SessionError::Disconnected(..) => ErrorKind::Disconnected,
            SessionError::Driver(..) => ErrorKind::Driver,
            SessionError::TransactionTimeout(..) => ErrorKind::TransactionTimeout,
            SessionError::InvalidState(..) => ErrorKind::InvalidState,
            SessionError::CommitInDoubt(..) => ErrorKind::CommitInDoubt,
            SessionError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            SessionError::DrainTimeout { .. } => ErrorKind::DrainTimeout,
            SessionError::Decode { .. } => ErrorKind::Decode,
            SessionError::Config(..) => ErrorKind::Config,
            SessionError::Application(..) => ErrorKind::Application,
        }
    }

    pub fn driver(error: impl Into<anyhow::Error>) -> Self {
        SessionError::Driver(error.into())
    }

    pub fn disconnected(error: impl Into<anyhow::Error>) -> Self {
        SessionError::Disconnected(error.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        SessionError::InvalidState(message.into())
    }

    /// True when the connection that produced this error can no longer be trusted.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SessionError::Disconnected(..) | SessionError::CommitInDoubt(..)
        )
    }

    /// The error that caused the last attempt to fail, unwrapping `RetriesExhausted`.
    pub fn root(&self) -> &SessionError {
        match self {
            SessionError::RetriesExhausted { last, .. } => last.root(),
            _ => self,
        }
    }
}
