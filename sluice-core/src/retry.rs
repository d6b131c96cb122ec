use crate::{ErrorKind, Result, RetryConfig, SessionError};
use rand::Rng;
use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Running the whole operation again may succeed.
    Transient,
    Fatal,
}

pub type Classifier = Arc<dyn Fn(&SessionError) -> ErrorClass + Send + Sync>;

/// Transient: pool exhaustion, lost connections, serialization failures, deadlocks and lock
/// timeouts. Everything else is fatal, including `VersionConflict` and `RowLocked` which the
/// caller handles, and `CommitInDoubt` which must never be replayed blindly.
pub fn default_classifier(error: &SessionError) -> ErrorClass {
    match error.kind() {
        ErrorKind::PoolTimeout
        | ErrorKind::Disconnected
        | ErrorKind::SerializationConflict
        | ErrorKind::DeadlockDetected
        | ErrorKind::LockTimeout => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

/// Decision taken after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Number of the attempt about to start, the first retry is attempt 2.
    pub attempt: u32,
    pub delay: Duration,
    pub class: ErrorClass,
}

/// Bounded exponential backoff around a whole operation.
///
/// The delay before attempt `n + 1` is `min(base_delay * 2^(n - 1), max_delay)`, with jitter a
/// uniformly random value between half of it and all of it.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    classifier: Classifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&Default::default())
    }
}

impl Debug for RetryPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter: config.jitter,
            classifier: Arc::new(default_classifier),
        }
    }

    /// A single attempt. Fatal errors are returned as they are, transient ones wrapped in
    /// [`SessionError::RetriesExhausted`] with one attempt.
    pub fn never() -> Self {
        Self::new(&RetryConfig::default().with_max_attempts(1))
    }

    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&SessionError) -> ErrorClass + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn classify(&self, error: &SessionError) -> ErrorClass {
        (self.classifier)(error)
    }

    /// Backoff before `attempt` (2 for the first retry), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(31);
        self.base_delay
            .checked_mul(1 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Upper bound of the time spent sleeping across all attempts.
    pub fn max_total_delay(&self) -> Duration {
        (2..=self.max_attempts)
            .map(|v| self.delay_for(v))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let nanos = delay.as_nanos().min(u64::MAX as u128) as u64;
        Duration::from_nanos(rand::thread_rng().gen_range(nanos / 2..=nanos))
    }

    /// Decide what happens after attempt number `attempt` failed with `error`.
    ///
    /// Fatal errors come back unchanged, transient ones past the budget are wrapped in
    /// [`SessionError::RetriesExhausted`].
    pub fn next_attempt(&self, attempt: u32, error: SessionError) -> Result<RetryAttempt> {
        let class = self.classify(&error);
        if class == ErrorClass::Fatal {
            return Err(error);
        }
        if attempt >= self.max_attempts {
            log::warn!("Giving up after {} attempts: {:#}", attempt, error);
            return Err(SessionError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(error),
            });
        }
        let delay = self.jittered(self.delay_for(attempt + 1));
        log::warn!(
            "Attempt {} of {} failed, retrying in {:?}: {:#}",
            attempt,
            self.max_attempts,
            delay,
            error
        );
        Ok(RetryAttempt {
            attempt: attempt + 1,
            delay,
            class,
        })
    }

    /// Run `operation` until it succeeds, fails with a fatal error or runs out of attempts.
    ///
    /// The closure receives the attempt number, starting at 1.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let next = self.next_attempt(attempt, error)?;
                    sleep(next.delay).await;
                    attempt = next.attempt;
                }
            }
        }
    }
}
