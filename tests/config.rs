#[cfg(test)]
mod tests {
    use sluice::{ErrorKind, IsolationLevel, PoolConfig, SessionConfig, parse_duration};
    use std::{env, sync::Mutex, time::Duration};

    /// Configuration reads the environment, tests touching it run one at a time.
    static MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn from_url() {
        let _guard = MUTEX.lock().unwrap();
        let config = SessionConfig::from_url(
            "memory://bank?max_size=4&max_overflow=2&min_idle=1&acquire_timeout=250ms\
             &pool_recycle=10m&pre_ping=yes&shutdown_timeout=3s&isolation=repeatable_read\
             &statement_timeout=100&transaction_timeout=2s&retry_max_attempts=5\
             &retry_base_delay=10ms&retry_max_delay=1s&retry_jitter=off&cache=shared",
        )
        .expect("Valid configuration");
        assert_eq!(config.url, "memory://bank?cache=shared");
        assert_eq!(
            config.pool,
            PoolConfig::default()
                .with_max_size(4)
                .with_max_overflow(2)
                .with_min_idle(1)
                .with_acquire_timeout(Duration::from_millis(250))
                .with_pool_recycle(Some(Duration::from_secs(600)))
                .with_pre_ping(true)
                .with_shutdown_timeout(Duration::from_secs(3))
        );
        assert_eq!(config.pool.capacity(), 6);
        assert_eq!(config.default_isolation, IsolationLevel::RepeatableRead);
        assert_eq!(config.statement_timeout, Some(Duration::from_millis(100)));
        assert_eq!(config.transaction_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(10));
        assert_eq!(config.retry.max_delay, Duration::from_secs(1));
        assert!(!config.retry.jitter);

        let config = SessionConfig::from_url("memory://plain").expect("Valid configuration");
        assert_eq!(config, SessionConfig::new("memory://plain"));
    }

    #[test]
    fn from_url_percent_encoded() {
        let _guard = MUTEX.lock().unwrap();
        let config = SessionConfig::from_url("memory://bank%3Fisolation%3DSERIALIZABLE")
            .expect("Valid configuration");
        assert_eq!(config.default_isolation, IsolationLevel::Serializable);
        assert_eq!(config.url, "memory://bank");
    }

    #[test]
    fn from_environment() {
        let _guard = MUTEX.lock().unwrap();
        unsafe {
            env::set_var("SLUICE_MAX_OVERFLOW", "3");
            env::set_var("SLUICE_ISOLATION", "serializable");
        }
        let config = SessionConfig::from_url("memory://bank?isolation=read-committed");
        unsafe {
            env::remove_var("SLUICE_MAX_OVERFLOW");
            env::remove_var("SLUICE_ISOLATION");
        }
        let config = config.expect("Valid configuration");
        assert_eq!(config.pool.max_overflow, 3);
        // The url wins over the environment.
        assert_eq!(config.default_isolation, IsolationLevel::ReadCommitted);
    }

    #[test]
    fn invalid() {
        let _guard = MUTEX.lock().unwrap();
        for url in [
            "memory://bank?max_size=0",
            "memory://bank?max_size=-1",
            "memory://bank?min_idle=5&max_size=2",
            "memory://bank?acquire_timeout=soon",
            "memory://bank?isolation=snapshot",
            "memory://bank?pre_ping=maybe",
            "memory://bank?retry_max_attempts=0",
            "memory://bank?retry_base_delay=5s&retry_max_delay=1s",
            "not a url",
        ] {
            let result = SessionConfig::from_url(url);
            assert!(
                matches!(&result, Err(e) if e.kind() == ErrorKind::Config),
                "`{}` should be rejected, got {:?}",
                url,
                result
            );
        }
    }

    #[test]
    fn isolation_level() {
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "repeatable-read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            " Serializable ".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("read uncommitted".parse::<IsolationLevel>().is_err());
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert_eq!(IsolationLevel::RepeatableRead.sql(), "REPEATABLE READ");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("1500").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(" 250ms ").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("1h").is_err());
        assert!(parse_duration("ms").is_err());
    }
}
