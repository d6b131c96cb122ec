use crate::{MemoryConnection, MemoryDatabase};
use anyhow::anyhow;
use sluice_core::{Driver, GenericSqlWriter, Result, SessionError};
use std::sync::Arc;

/// Driver whose connections all reach the same [`MemoryDatabase`].
///
/// Urls have the form `memory://<name>`, the name is informative only: two drivers never share
/// data unless built with [`MemoryDriver::with_database`] on the same database.
#[derive(Default, Clone)]
pub struct MemoryDriver {
    database: Arc<MemoryDatabase>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(database: Arc<MemoryDatabase>) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }
}

impl Driver for MemoryDriver {
    type Connection = MemoryConnection;
    type SqlWriter = GenericSqlWriter;

    const NAME: &'static str = "memory";

    fn sql_writer(&self) -> GenericSqlWriter {
        GenericSqlWriter
    }

    async fn connect(&self, url: &str) -> Result<MemoryConnection> {
        let prefix = format!("{}://", Self::NAME);
        if !url.starts_with(&prefix) {
            let error = SessionError::driver(anyhow!(
                "Expected memory connection url to start with `{}`",
                &prefix
            ));
            log::error!("{:#}", error);
            return Err(error);
        }
        self.database.open()
    }
}
