use crate::{ErrorContext, IsolationLevel, Result, SessionError, parse_duration};
use anyhow::anyhow;
use std::{env, str::FromStr, time::Duration};
use url::Url;
use urlencoding::decode;

/// Sizing and lifecycle of the connection pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Connections kept open in steady state.
    pub max_size: usize,
    /// Extra connections opened under burst, closed as soon as they are returned.
    pub max_overflow: usize,
    /// Connections opened when the pool starts.
    pub min_idle: usize,
    pub acquire_timeout: Duration,
    /// Connections older than this are closed instead of reused.
    pub pool_recycle: Option<Duration>,
    /// Probe idle connections before handing them out. Returned connections are always probed.
    pub pre_ping: bool,
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_overflow: 0,
            min_idle: 0,
            acquire_timeout: Duration::from_secs(30),
            pool_recycle: None,
            pre_ping: false,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, value: usize) -> Self {
        self.max_size = value;
        self
    }
    pub fn with_max_overflow(mut self, value: usize) -> Self {
        self.max_overflow = value;
        self
    }
    pub fn with_min_idle(mut self, value: usize) -> Self {
        self.min_idle = value;
        self
    }
    pub fn with_acquire_timeout(mut self, value: Duration) -> Self {
        self.acquire_timeout = value;
        self
    }
    pub fn with_pool_recycle(mut self, value: Option<Duration>) -> Self {
        self.pool_recycle = value;
        self
    }
    pub fn with_pre_ping(mut self, value: bool) -> Self {
        self.pre_ping = value;
        self
    }
    pub fn with_shutdown_timeout(mut self, value: Duration) -> Self {
        self.shutdown_timeout = value;
        self
    }

    /// Upper bound on connections open at the same time.
    pub fn capacity(&self) -> usize {
        self.max_size.saturating_add(self.max_overflow)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(SessionError::Config(anyhow!("max_size must be at least 1")));
        }
        if self.min_idle > self.max_size {
            return Err(SessionError::Config(anyhow!(
                "min_idle ({}) cannot exceed max_size ({})",
                self.min_idle,
                self.max_size
            )));
        }
        Ok(())
    }
}

/// Backoff parameters of the retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one, `1` disables retries.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = value;
        self
    }
    pub fn with_base_delay(mut self, value: Duration) -> Self {
        self.base_delay = value;
        self
    }
    pub fn with_max_delay(mut self, value: Duration) -> Self {
        self.max_delay = value;
        self
    }
    pub fn with_jitter(mut self, value: bool) -> Self {
        self.jitter = value;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SessionError::Config(anyhow!(
                "retry max_attempts must be at least 1"
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(SessionError::Config(anyhow!(
                "retry base_delay ({:?}) cannot exceed max_delay ({:?})",
                self.base_delay,
                self.max_delay
            )));
        }
        Ok(())
    }
}

/// Everything a `SessionManager` needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Driver url, stripped of the parameters consumed by `from_url`.
    pub url: String,
    pub pool: PoolConfig,
    pub default_isolation: IsolationLevel,
    /// Bound on a single lock wait or statement.
    pub statement_timeout: Option<Duration>,
    /// Bound on a whole transaction, statements and application code included.
    pub transaction_timeout: Option<Duration>,
    pub retry: RetryConfig,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool: Default::default(),
            default_isolation: Default::default(),
            statement_timeout: None,
            transaction_timeout: None,
            retry: Default::default(),
        }
    }

    /// Build the configuration from the query parameters of a url.
    ///
    /// Recognized keys are removed from the url, any other parameter is left for the driver.
    /// A key missing from the url is looked up in the environment as `SLUICE_<KEY>`
    /// (uppercase).
    ///
    /// ```rust
    /// use sluice_core::{IsolationLevel, SessionConfig};
    /// use std::time::Duration;
    /// let config = SessionConfig::from_url(
    ///     "memory://bank?max_size=4&acquire_timeout=250ms&isolation=serializable&cache=shared",
    /// )
    /// .unwrap();
    /// assert_eq!(config.pool.max_size, 4);
    /// assert_eq!(config.pool.acquire_timeout, Duration::from_millis(250));
    /// assert_eq!(config.default_isolation, IsolationLevel::Serializable);
    /// assert_eq!(config.url, "memory://bank?cache=shared");
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let context = || format!("While reading the session configuration from `{}`", url);
        let decoded = decode(url)
            .with_context(context)
            .map_err(SessionError::Config)?;
        let mut url = Url::parse(&decoded)
            .with_context(context)
            .map_err(SessionError::Config)?;
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut take = |key: &str| {
            let env_var = format!("SLUICE_{}", key.to_ascii_uppercase());
            let value = pairs
                .iter()
                .position(|(k, _)| k == key)
                .map(|pos| pairs.remove(pos).1);
            value.or_else(|| env::var(env_var).ok())
        };
        let mut config = SessionConfig::new(String::new());
        let pool = &mut config.pool;
        if let Some(v) = take("max_size") {
            pool.max_size = parse_value("max_size", &v)?;
        }
        if let Some(v) = take("max_overflow") {
            pool.max_overflow = parse_value("max_overflow", &v)?;
        }
        if let Some(v) = take("min_idle") {
            pool.min_idle = parse_value("min_idle", &v)?;
        }
        if let Some(v) = take("acquire_timeout") {
            pool.acquire_timeout = parse_duration(&v)?;
        }
        if let Some(v) = take("pool_recycle") {
            pool.pool_recycle = Some(parse_duration(&v)?);
        }
        if let Some(v) = take("pre_ping") {
            pool.pre_ping = parse_flag("pre_ping", &v)?;
        }
        if let Some(v) = take("shutdown_timeout") {
            pool.shutdown_timeout = parse_duration(&v)?;
        }
        if let Some(v) = take("isolation") {
            config.default_isolation = v.parse()?;
        }
        if let Some(v) = take("statement_timeout") {
            config.statement_timeout = Some(parse_duration(&v)?);
        }
        if let Some(v) = take("transaction_timeout") {
            config.transaction_timeout = Some(parse_duration(&v)?);
        }
        let retry = &mut config.retry;
        if let Some(v) = take("retry_max_attempts") {
            retry.max_attempts = parse_value("retry_max_attempts", &v)?;
        }
        if let Some(v) = take("retry_base_delay") {
            retry.base_delay = parse_duration(&v)?;
        }
        if let Some(v) = take("retry_max_delay") {
            retry.max_delay = parse_duration(&v)?;
        }
        if let Some(v) = take("retry_jitter") {
            retry.jitter = parse_flag("retry_jitter", &v)?;
        }
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut()
                .clear()
                .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        config.url = url.into();
        config.validate()?;
        Ok(config)
    }

    pub fn with_pool(mut self, value: PoolConfig) -> Self {
        self.pool = value;
        self
    }
    pub fn with_default_isolation(mut self, value: IsolationLevel) -> Self {
        self.default_isolation = value;
        self
    }
    pub fn with_statement_timeout(mut self, value: Option<Duration>) -> Self {
        self.statement_timeout = value;
        self
    }
    pub fn with_transaction_timeout(mut self, value: Option<Duration>) -> Self {
        self.transaction_timeout = value;
        self
    }
    pub fn with_retry(mut self, value: RetryConfig) -> Self {
        self.retry = value;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.retry.validate()
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value `{}` for `{}`", value, key))
        .map_err(SessionError::Config)
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SessionError::Config(anyhow!(
            "Invalid value `{}` for `{}`, expected a boolean",
            value,
            key
        ))),
    }
}
