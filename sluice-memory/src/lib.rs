mod connection;
mod database;
mod driver;
mod faults;
mod locks;

pub use connection::*;
pub use database::*;
pub use driver::*;
pub use faults::Fault;
