mod as_value;
mod config;
mod driver;
mod entity;
mod error;
mod lock;
mod pool;
mod retry;
mod session;
mod sql_writer;
mod statement;
mod transaction;
mod unit_of_work;
mod util;
mod value;

pub use ::anyhow::Context as ErrorContext;
pub use as_value::*;
pub use config::*;
pub use driver::*;
pub use entity::*;
pub use error::*;
pub use lock::*;
pub use pool::*;
pub use retry::*;
pub use session::*;
pub use sql_writer::*;
pub use statement::*;
pub use transaction::*;
pub use unit_of_work::*;
pub use util::*;
pub use value::*;
pub use ::futures::future;

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
