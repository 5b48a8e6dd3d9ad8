//! Transactions with isolation level and read-only handling.

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{DriverError, Result};

/// Requested transaction isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    WriteCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
    Linearizable,
}

impl IsolationLevel {
    /// Numeric level understood by `SET TRANSACTION ISOLATION LEVEL`.
    pub fn server_level(self) -> Result<u8> {
        match self {
            IsolationLevel::ReadUncommitted => Ok(0),
            IsolationLevel::Default | IsolationLevel::ReadCommitted => Ok(1),
            IsolationLevel::RepeatableRead => Ok(2),
            IsolationLevel::Serializable => Ok(3),
            IsolationLevel::WriteCommitted
            | IsolationLevel::Snapshot
            | IsolationLevel::Linearizable => Err(DriverError::UnsupportedIsolationLevel(self)),
        }
    }
}

/// Options for [`Connection::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    pub fn new(isolation: IsolationLevel, read_only: bool) -> Self {
        Self {
            isolation,
            read_only,
        }
    }
}

/// An open transaction. Finished by [`Transaction::commit`] or
/// [`Transaction::rollback`]; dropping an unfinished transaction rolls it
/// back.
#[derive(Debug)]
pub struct Transaction {
    connection: Connection,
    isolation: IsolationLevel,
    read_only_prior: bool,
    read_only_needs_reset: bool,
    finished: bool,
}

impl Transaction {
    pub(crate) fn begin(connection: &Connection, options: TxOptions) -> Result<Transaction> {
        let level = options.isolation.server_level()?;

        connection.exec("BEGIN TRANSACTION", &[])?;
        let mut tx = Transaction {
            connection: connection.clone(),
            isolation: options.isolation,
            read_only_prior: false,
            read_only_needs_reset: false,
            finished: false,
        };

        if let Err(err) = tx.configure(level, options.read_only) {
            if let Err(rollback_err) = tx.rollback() {
                warn!(error = %rollback_err, "failed to roll back after begin failure");
            }
            return Err(err);
        }

        debug!(isolation = level, read_only = options.read_only, "transaction started");
        Ok(tx)
    }

    fn configure(&mut self, level: u8, read_only: bool) -> Result<()> {
        self.connection
            .exec(&format!("SET TRANSACTION ISOLATION LEVEL {}", level), &[])?;

        let current = self.connection.read_only()?;
        if current != read_only {
            self.connection.set_read_only(read_only)?;
            self.read_only_prior = current;
            self.read_only_needs_reset = true;
        }
        Ok(())
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT TRANSACTION")
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK TRANSACTION")
    }

    fn finish(&mut self, statement: &str) -> Result<()> {
        if self.finished {
            return Err(DriverError::ResourceMisuse(
                "transaction already finished".to_string(),
            ));
        }
        self.finished = true;

        let ended = self.connection.exec(statement, &[]).map(|_| ());
        let restored = if self.read_only_needs_reset {
            self.read_only_needs_reset = false;
            self.connection.set_read_only(self.read_only_prior)
        } else {
            Ok(())
        };
        debug!(statement, "transaction finished");
        ended.and(restored)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.connection.is_closed() {
            if let Err(err) = self.rollback() {
                warn!(error = %err, "failed to roll back dropped transaction");
            }
        }
    }
}
