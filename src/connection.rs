//! Sessions against the server.
//!
//! A [`Connection`] owns one native session registered with a shared
//! [`SessionContext`]. It is a cheap handle around shared state so that
//! commands, transactions and background workers can hold on to it; the
//! session itself is released exactly once by [`Connection::close`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::command::{Command, ExecResult};
use crate::config::ConnectionInfo;
use crate::connector::run_cancellable;
use crate::context::SessionContext;
use crate::error::{DriverError, Result};
use crate::rows::Rows;
use crate::statement::Statement;
use crate::transaction::{Transaction, TxOptions};
use crate::transport::{SessionHandle, SessionProperty, Transport};
use crate::types::Value;

struct ConnectionInner {
    context: Arc<SessionContext>,
    session: Mutex<Option<SessionHandle>>,
}

/// An open session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a session: register with the context, set the session
    /// properties, connect and switch to the configured database.
    ///
    /// Any failure releases everything acquired so far.
    pub fn open(context: Arc<SessionContext>, info: &ConnectionInfo) -> Result<Connection> {
        let ctx = context.acquire()?;
        let session = match context.transport().session_alloc(ctx) {
            Ok(session) => session,
            Err(code) => {
                if let Err(err) = context.release() {
                    warn!(error = %err, "failed to release context after session allocation failure");
                }
                return Err(DriverError::transport(code, "ct_con_alloc"));
            }
        };

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                context,
                session: Mutex::new(Some(session)),
            }),
        };

        if let Err(err) = connection.establish(session, info) {
            if let Err(close_err) = connection.close() {
                warn!(error = %close_err, "failed to close partially opened connection");
            }
            return Err(err);
        }

        info!(
            host = %info.host,
            port = info.port,
            database = %info.database,
            "connection opened"
        );
        Ok(connection)
    }

    fn establish(&self, session: SessionHandle, info: &ConnectionInfo) -> Result<()> {
        let mut properties = vec![
            SessionProperty::ExtendedEncryption(true),
            SessionProperty::NonEncryptionRetry(false),
        ];
        if !info.user_store_key.is_empty() {
            properties.push(SessionProperty::UserStoreKey(info.user_store_key.clone()));
        } else {
            properties.push(SessionProperty::Username(info.username.clone()));
            properties.push(SessionProperty::Password(info.password.clone()));
        }
        if !info.host.is_empty() {
            properties.push(SessionProperty::ServerAddr(info.server_addr()));
        }
        if !info.app_name.is_empty() {
            properties.push(SessionProperty::AppName(info.app_name.clone()));
        }

        let transport = self.transport();
        for property in &properties {
            transport
                .set_property(session, property)
                .check(property.label())?;
        }
        transport.connect(session).check("ct_connect")?;

        if !info.database.is_empty() {
            self.exec(&format!("use {}", info.database), &[])
                .map_err(|err| {
                    debug!(database = %info.database, error = %err, "failed to switch database");
                    err
                })?;
        }
        Ok(())
    }

    #[inline]
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.inner.context
    }

    #[inline]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.inner.context.transport()
    }

    /// Native session handle, failing once the connection is closed.
    pub fn session(&self) -> Result<SessionHandle> {
        let session = *self.inner.session.lock();
        session.ok_or_else(|| DriverError::ResourceMisuse("connection is closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.session.lock().is_none()
    }

    /// Close the session and release the context reference.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(session) = self.inner.session.lock().take() else {
            return Ok(());
        };
        let transport = self.transport();

        let result = transport
            .session_cancel(session)
            .check("ct_cancel(CS_CANCEL_ALL)")
            .and(transport.session_close(session).check("ct_close"))
            .and(transport.session_drop(session).check("ct_con_drop"))
            .and(self.inner.context.release());
        debug!(session = session.0, "connection closed");
        result
    }

    /// Run a trivial query; any failure means the connection is unusable.
    pub fn ping(&self) -> Result<()> {
        let mut rows = self
            .query("SELECT 'PING'", &[])
            .map_err(|_| DriverError::BadConnection)?;
        loop {
            match rows.next_row() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "ping failed while draining");
                    return Err(DriverError::BadConnection);
                }
            }
        }
        rows.close().map_err(|_| DriverError::BadConnection)
    }

    /// Execute `query` and return the first result set, if any, and the
    /// accumulated row counts.
    ///
    /// Without arguments the text is sent as a language command. With
    /// arguments it is prepared as a temporary statement that is closed
    /// together with the returned rows, or immediately when there are none.
    pub fn generic_exec(&self, query: &str, args: &[Value]) -> Result<(Option<Rows>, ExecResult)> {
        if args.is_empty() {
            let command = Command::direct(self, query)?;
            let response = command.send().and_then(|_| command.consume_response());
            return match response {
                Ok((Some(rows), result)) => Ok((Some(rows), result)),
                Ok((None, result)) => {
                    command.close()?;
                    Ok((None, result))
                }
                Err(err) => {
                    if let Err(close_err) = command.close() {
                        warn!(error = %close_err, "failed to drop command");
                    }
                    Err(err)
                }
            };
        }

        let mut statement = Statement::prepare(self, query)?;
        match statement.exec(args) {
            Ok((Some(mut rows), result)) => {
                rows.attach_statement(statement);
                Ok((Some(rows), result))
            }
            Ok((None, result)) => {
                statement.close()?;
                Ok((None, result))
            }
            Err(err) => {
                if let Err(close_err) = statement.close() {
                    warn!(error = %close_err, "failed to close temporary statement");
                }
                Err(err)
            }
        }
    }

    /// Execute a statement, discarding any result set.
    pub fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let (rows, result) = self.generic_exec(query, args)?;
        if let Some(mut rows) = rows {
            rows.close()?;
        }
        Ok(result)
    }

    /// Execute a query that must produce a result set.
    pub fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        match self.generic_exec(query, args)? {
            (Some(rows), _) => Ok(rows),
            (None, _) => Err(DriverError::ProtocolViolation(format!(
                "query produced no result set: {}",
                query
            ))),
        }
    }

    pub fn prepare(&self, query: &str) -> Result<Statement> {
        Statement::prepare(self, query)
    }

    /// Normalize an application value before it is bound.
    pub fn check_value(&self, value: Value) -> Result<Value> {
        Ok(match value {
            Value::UInt(u) => match i64::try_from(u) {
                Ok(i) => Value::Int(i),
                Err(_) => Value::UInt(u),
            },
            Value::Float(f) if f.is_nan() => {
                return Err(DriverError::ArgumentMismatch(
                    "NaN cannot be sent to the server".to_string(),
                ))
            }
            other => other,
        })
    }

    /// Current value of the session's read-only property.
    pub fn read_only(&self) -> Result<bool> {
        let session = self.session()?;
        self.transport()
            .read_only(session)
            .map_err(|code| DriverError::transport(code, "ct_con_props(CS_GET, CS_PROP_READONLY)"))
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        let property = SessionProperty::ReadOnly(read_only);
        self.transport()
            .set_property(self.session()?, &property)
            .check(property.label())
    }

    /// Begin a transaction, blocking until the server acknowledges it.
    pub fn begin(&self, options: TxOptions) -> Result<Transaction> {
        Transaction::begin(self, options)
    }

    /// Begin a transaction on a blocking worker, giving up when `cancel`
    /// completes first.
    ///
    /// A transaction that completes after cancellation is rolled back in
    /// the background.
    pub async fn begin_tx<F>(&self, options: TxOptions, cancel: F) -> Result<Transaction>
    where
        F: Future<Output = ()>,
    {
        let connection = self.clone();
        run_cancellable(
            move || Transaction::begin(&connection, options),
            |mut tx: Transaction| {
                if let Err(err) = tx.rollback() {
                    warn!(error = %err, "failed to roll back abandoned transaction");
                }
            },
            cancel,
        )
        .await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session", &*self.inner.session.lock())
            .finish()
    }
}
