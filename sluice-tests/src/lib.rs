mod accounts;
mod atomicity;
mod optimistic;
mod pessimistic;
mod pool;
mod retry;
mod savepoints;
#[cfg(not(feature = "disable-serializable"))]
mod serializable;
mod timeouts;
mod unit_of_work;

pub use accounts::*;

use crate::{
    atomicity::{atomicity, explicit_rollback},
    optimistic::{optimistic_contention, optimistic_strategy},
    pessimistic::{lock_order, no_wait, reverse_order_deadlock},
    pool::{acquire_deadline, drain, overflow, pool_bound, three_sessions_two_connections},
    retry::{committed_not_retried, fatal_not_retried, retry_boundedness},
    savepoints::{nested, savepoint_isolation, savepoint_locks, savepoint_misuse},
    timeouts::{cancellation_releases, lock_timeout, transaction_timeout},
    unit_of_work::{unit_of_work_rollback, unit_of_work_transfer},
};
use log::LevelFilter;
#[cfg(not(feature = "disable-skip-locked"))]
use pessimistic::skip_locked;
#[cfg(not(feature = "disable-serializable"))]
use serializable::serializable_retried;
use sluice::Driver;
use std::env;

pub fn init_logs() {
    let mut logger = env_logger::builder();
    logger
        .is_test(true)
        .format_file(true)
        .format_line_number(true);
    if env::var("RUST_LOG").is_err() {
        logger.filter_level(LevelFilter::Warn);
    }
    let _ = logger.try_init();
}

/// Run the whole suite against a driver. `url` is the connection url the driver accepts.
pub async fn execute_tests<D: Driver + Clone>(driver: D, url: &str) {
    pool_bound(&driver, url).await;
    acquire_deadline(&driver, url).await;
    three_sessions_two_connections(&driver, url).await;
    overflow(&driver, url).await;
    atomicity(&driver, url).await;
    explicit_rollback(&driver, url).await;
    savepoint_isolation(&driver, url).await;
    savepoint_misuse(&driver, url).await;
    savepoint_locks(&driver, url).await;
    nested(&driver, url).await;
    optimistic_contention(&driver, url).await;
    optimistic_strategy(&driver, url).await;
    lock_order(&driver, url).await;
    reverse_order_deadlock(&driver, url).await;
    no_wait(&driver, url).await;
    #[cfg(not(feature = "disable-skip-locked"))]
    skip_locked(&driver, url).await;
    retry_boundedness(&driver, url).await;
    fatal_not_retried(&driver, url).await;
    committed_not_retried(&driver, url).await;
    #[cfg(not(feature = "disable-serializable"))]
    serializable_retried(&driver, url).await;
    transaction_timeout(&driver, url).await;
    lock_timeout(&driver, url).await;
    cancellation_releases(&driver, url).await;
    unit_of_work_transfer(&driver, url).await;
    unit_of_work_rollback(&driver, url).await;
    drain(&driver, url).await;
}

#[macro_export]
macro_rules! silent_logs {
    ($($code:tt)+) => {{
        let level = log::max_level();
        log::set_max_level(log::LevelFilter::Off);
        $($code)+
        log::set_max_level(level);
    }};
}
