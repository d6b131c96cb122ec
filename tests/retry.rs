#[cfg(test)]
mod tests {
    use sluice::{
        EntityKey, ErrorClass, RetryConfig, RetryPolicy, SessionError, default_classifier,
    };
    use std::{sync::Mutex, time::Duration};

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn policy(max_attempts: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy::new(
            &RetryConfig::default()
                .with_max_attempts(max_attempts)
                .with_base_delay(ms(10))
                .with_max_delay(ms(45))
                .with_jitter(jitter),
        )
    }

    fn conflict() -> SessionError {
        SessionError::SerializationConflict("concurrent update".into())
    }

    #[test]
    fn exponential_delay() {
        let policy = policy(6, false);
        let delays: Vec<_> = (2..=6).map(|v| policy.delay_for(v)).collect();
        assert_eq!(delays, [ms(10), ms(20), ms(40), ms(45), ms(45)]);
        assert_eq!(policy.max_total_delay(), ms(160));
        assert_eq!(policy.delay_for(200), ms(45));
        assert_eq!(RetryPolicy::never().max_total_delay(), Duration::ZERO);
    }

    #[test]
    fn jitter_bounds() {
        let policy = policy(6, true);
        for _ in 0..100 {
            let next = policy.next_attempt(2, conflict()).unwrap();
            assert_eq!(next.attempt, 3);
            assert!(next.delay >= ms(10) && next.delay <= ms(20), "{:?}", next.delay);
        }
    }

    #[test]
    fn classification() {
        let transient = [
            SessionError::PoolTimeout(ms(1)),
            SessionError::disconnected(anyhow::anyhow!("gone")),
            conflict(),
            SessionError::DeadlockDetected("cycle".into()),
            SessionError::LockTimeout {
                key: EntityKey::new("accounts", 1),
                timeout: ms(5),
            },
        ];
        for error in &transient {
            assert_eq!(default_classifier(error), ErrorClass::Transient, "{:?}", error);
        }
        let fatal = [
            SessionError::VersionConflict {
                key: EntityKey::new("accounts", 1),
                expected: 2,
            },
            SessionError::RowLocked(EntityKey::new("accounts", 1)),
            SessionError::CommitInDoubt(anyhow::anyhow!("lost")),
            SessionError::TransactionTimeout(ms(5)),
            SessionError::invalid_state("closed"),
            SessionError::PoolClosed,
            SessionError::driver(anyhow::anyhow!("syntax error")),
            anyhow::anyhow!("application").into(),
        ];
        for error in &fatal {
            assert_eq!(default_classifier(error), ErrorClass::Fatal, "{:?}", error);
        }
    }

    #[test]
    fn next_attempt() {
        let policy = policy(3, false);
        let next = policy.next_attempt(1, conflict()).unwrap();
        assert_eq!((next.attempt, next.delay), (2, ms(10)));
        assert_eq!(next.class, ErrorClass::Transient);

        let error = policy.next_attempt(3, conflict()).unwrap_err();
        assert!(
            matches!(&error, SessionError::RetriesExhausted { attempts: 3, .. }),
            "{:?}",
            error
        );
        assert!(matches!(error.root(), SessionError::SerializationConflict(..)));

        let error = policy
            .next_attempt(1, SessionError::RowLocked(EntityKey::new("jobs", 4)))
            .unwrap_err();
        assert!(matches!(error, SessionError::RowLocked(..)));

        let policy = policy.with_classifier(|_| ErrorClass::Transient);
        assert!(
            policy
                .next_attempt(1, SessionError::RowLocked(EntityKey::new("jobs", 4)))
                .is_ok()
        );

        let never = RetryPolicy::never();
        let error = never.next_attempt(1, conflict()).unwrap_err();
        assert!(
            matches!(&error, SessionError::RetriesExhausted { attempts: 1, .. }),
            "{:?}",
            error
        );
        let error = never
            .next_attempt(1, SessionError::RowLocked(EntityKey::new("jobs", 4)))
            .unwrap_err();
        assert!(matches!(error, SessionError::RowLocked(..)));
    }

    #[tokio::test]
    async fn execute() {
        let policy = RetryPolicy::new(
            &RetryConfig::default()
                .with_max_attempts(4)
                .with_base_delay(ms(1))
                .with_max_delay(ms(2)),
        );
        let attempts = Mutex::new(Vec::new());
        let result = policy
            .execute(|attempt| {
                attempts.lock().unwrap().push(attempt);
                async move {
                    if attempt < 3 {
                        Err(SessionError::DeadlockDetected("cycle".into()))
                    } else {
                        Ok(attempt * 10)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 30);
        assert_eq!(*attempts.lock().unwrap(), [1, 2, 3]);

        let result: Result<(), _> = policy
            .execute(|_| async { Err(SessionError::invalid_state("not retried")) })
            .await;
        assert!(matches!(result, Err(SessionError::InvalidState(..))));
    }
}
