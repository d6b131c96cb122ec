use crate::{Fault, MemoryDatabase};
use anyhow::anyhow;
use sluice_core::{
    Connection, IsolationLevel, Result, RowSet, SessionError, SqlWriter, Statement,
    TransactionOptions,
};
use std::{sync::Arc, time::Duration};

#[derive(Debug, Clone, Copy)]
struct Transaction {
    id: u64,
    statement_timeout: Option<Duration>,
}

/// A session with a [`MemoryDatabase`].
///
/// Statements outside of a transaction run in autocommit mode. A connection is lost once the
/// database kills it or an injected fault disconnects it, its open transaction is rolled back
/// and every further operation fails with [`SessionError::Disconnected`].
pub struct MemoryConnection {
    database: Arc<MemoryDatabase>,
    id: u64,
    epoch: u64,
    lost: bool,
    transaction: Option<Transaction>,
}

impl MemoryConnection {
    pub(crate) fn new(database: Arc<MemoryDatabase>, id: u64, epoch: u64) -> Self {
        log::trace!("Memory connection {} opened", id);
        Self {
            database,
            id,
            epoch,
            lost: false,
            transaction: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn lose(&mut self) {
        self.lost = true;
        if let Some(transaction) = self.transaction.take() {
            self.database.rollback(transaction.id);
        }
    }

    fn ensure_alive(&mut self) -> Result<()> {
        if !self.lost && self.epoch == self.database.epoch() {
            return Ok(());
        }
        self.lose();
        Err(SessionError::disconnected(anyhow!(
            "memory connection {} was terminated",
            self.id
        )))
    }

    fn transaction(&self) -> Result<Transaction> {
        self.transaction
            .ok_or_else(|| SessionError::driver(anyhow!("there is no transaction in progress")))
    }

    /// A lost transaction means a lost connection.
    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_disconnect()
        {
            self.lose();
        }
        result
    }

    async fn autocommit(&mut self, statement: &Statement) -> Result<RowSet> {
        let database = &self.database;
        let transaction = database.begin(self.id, IsolationLevel::ReadCommitted);
        match database.execute(transaction, statement, None).await {
            Ok(rows) => {
                database.commit(transaction)?;
                Ok(rows)
            }
            Err(e) => {
                database.rollback(transaction);
                Err(e)
            }
        }
    }
}

impl Connection for MemoryConnection {
    async fn begin(&mut self, options: &TransactionOptions) -> Result<()> {
        self.ensure_alive()?;
        if self.transaction.is_some() {
            return Err(SessionError::driver(anyhow!(
                "there is already a transaction in progress"
            )));
        }
        self.database
            .journal_with(|w, out| w.write_transaction_begin(out, options.isolation));
        let id = self.database.begin(self.id, options.isolation);
        self.transaction = Some(Transaction {
            id,
            statement_timeout: options.statement_timeout,
        });
        Ok(())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<RowSet> {
        self.ensure_alive()?;
        let fault = self.database.faults().take_statement();
        if let Some(fault) = fault {
            log::debug!("Injecting {:?} into `{}`", fault, statement);
            if fault == Fault::Disconnect {
                self.lose();
            }
            return Err(fault.error());
        }
        self.database
            .journal_with(|w, out| w.write_statement(out, statement));
        let result = match self.transaction {
            Some(transaction) => {
                self.database
                    .execute(transaction.id, statement, transaction.statement_timeout)
                    .await
            }
            None => self.autocommit(statement).await,
        };
        self.observe(result)
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_alive()?;
        let transaction = self.transaction()?;
        self.database
            .journal_with(|w, out| w.write_savepoint(out, name));
        let result = self.database.savepoint(transaction.id, name);
        self.observe(result)
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_alive()?;
        let transaction = self.transaction()?;
        self.database
            .journal_with(|w, out| w.write_release_savepoint(out, name));
        let result = self.database.release_savepoint(transaction.id, name);
        self.observe(result)
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_alive()?;
        let transaction = self.transaction()?;
        self.database
            .journal_with(|w, out| w.write_rollback_to_savepoint(out, name));
        let result = self.database.rollback_to_savepoint(transaction.id, name);
        self.observe(result)
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_alive()?;
        let transaction = self.transaction()?;
        if self.database.faults().take_commit() {
            log::debug!("Losing memory connection {} during commit", self.id);
            self.lose();
            return Err(SessionError::disconnected(anyhow!(
                "server closed the connection during commit"
            )));
        }
        self.transaction = None;
        self.database
            .journal_with(|w, out| w.write_transaction_commit(out));
        let result = self.database.commit(transaction.id);
        self.observe(result)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_alive()?;
        if let Some(transaction) = self.transaction.take() {
            self.database
                .journal_with(|w, out| w.write_transaction_rollback(out));
            self.database.rollback(transaction.id);
        }
        Ok(())
    }

    async fn probe_liveness(&mut self) -> bool {
        let injected = self.database.faults().take_probe();
        !injected && self.ensure_alive().is_ok()
    }

    async fn close(self) -> Result<()> {
        log::trace!("Memory connection {} closed", self.id);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            log::debug!(
                "Memory connection {} dropped inside a transaction, rolling back",
                self.id
            );
            self.database.rollback(transaction.id);
        }
        self.database.connection_closed();
    }
}
