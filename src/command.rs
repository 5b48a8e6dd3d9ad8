//! Command state machine and the response loop.
//!
//! A [`Command`] wraps one native command handle and drives one
//! request/response cycle at a time:
//!
//! ```text
//! direct:  Built -> Executing -> AwaitingResponse -> {Rows | Done} -> Closed
//! dynamic: Unprepared -> Preparing -> Prepared -> Executing
//!              -> AwaitingResponse -> {Rows | Done} -> Closed
//! ```
//!
//! Direct commands carry a language request and are dropped after one use.
//! Dynamic commands carry a server-side prepared statement and live as long
//! as their [`crate::Statement`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{DriverError, Result};
use crate::rows::Rows;
use crate::transport::{CancelKind, CommandHandle, ResInfo, ResultType, RetCode, Transport};

/// Lifecycle state of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Built,
    Unprepared,
    Preparing,
    Prepared,
    Executing,
    AwaitingResponse,
    Rows,
    Done,
    Closed,
}

// ============================================================================
// Exec result
// ============================================================================

/// Summary of a command that produced no result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    rows_affected: u64,
}

impl ExecResult {
    pub fn new(rows_affected: u64) -> Self {
        Self { rows_affected }
    }

    /// Sum of the row counts reported by every completed command phase.
    #[inline]
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// The server does not report generated keys.
    pub fn last_insert_id(&self) -> Option<i64> {
        None
    }

    fn add(&mut self, count: i32) {
        if let Ok(count) = u64::try_from(count) {
            self.rows_affected += count;
        }
    }
}

// ============================================================================
// Command
// ============================================================================

/// One native command handle and its state.
pub struct Command {
    connection: Connection,
    transport: Arc<dyn Transport>,
    handle: CommandHandle,
    dynamic: bool,
    name: Option<String>,
    state: Mutex<CommandState>,
}

impl Command {
    /// Allocate a direct command carrying `query` as a language request.
    pub(crate) fn direct(connection: &Connection, query: &str) -> Result<Arc<Command>> {
        let command = Self::allocate(connection, false, None)?;
        command
            .transport
            .language(command.handle, query)
            .check("ct_command")?;
        Ok(Arc::new(command))
    }

    /// Allocate a dynamic command for the prepared statement `name`.
    pub(crate) fn dynamic(connection: &Connection, name: &str) -> Result<Arc<Command>> {
        Ok(Arc::new(Self::allocate(
            connection,
            true,
            Some(name.to_string()),
        )?))
    }

    fn allocate(connection: &Connection, dynamic: bool, name: Option<String>) -> Result<Command> {
        let session = connection.session()?;
        let transport = connection.transport().clone();
        let handle = transport
            .command_alloc(session)
            .map_err(|code| DriverError::transport(code, "ct_cmd_alloc"))?;
        Ok(Command {
            connection: connection.clone(),
            transport,
            handle,
            dynamic,
            name,
            state: Mutex::new(if dynamic {
                CommandState::Unprepared
            } else {
                CommandState::Built
            }),
        })
    }

    #[inline]
    pub fn handle(&self) -> CommandHandle {
        self.handle
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Server-side statement name of a dynamic command.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> CommandState {
        *self.state.lock()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn set_state(&self, state: CommandState) {
        *self.state.lock() = state;
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CommandState::Closed
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DriverError::ResourceMisuse("command is closed".to_string()));
        }
        Ok(())
    }

    /// Send the pending request.
    pub(crate) fn send(&self) -> Result<()> {
        self.ensure_open()?;
        self.set_state(CommandState::Executing);
        self.transport.send(self.handle).check("ct_send")?;
        self.set_state(CommandState::AwaitingResponse);
        Ok(())
    }

    /// Read result phases until a result set appears or the response ends.
    ///
    /// Row-bearing phases return an open [`Rows`] immediately; completed
    /// commands add their row count to the [`ExecResult`]; describe phases
    /// are skipped. Any failure cancels the remaining response and returns
    /// the command to its idle state.
    pub fn consume_response(self: &Arc<Self>) -> Result<(Option<Rows>, ExecResult)> {
        self.ensure_open()?;
        let mut result = ExecResult::default();

        match self.read_until_rows(&mut result) {
            Ok(Some(rows)) => Ok((Some(rows), result)),
            Ok(None) => {
                self.set_state(CommandState::Done);
                Ok((None, result))
            }
            Err(err) => {
                self.abandon_response();
                Err(err)
            }
        }
    }

    fn read_until_rows(self: &Arc<Self>, result: &mut ExecResult) -> Result<Option<Rows>> {
        while let Some(kind) = self.next_phase()? {
            match kind {
                kind if kind.has_rows() => {
                    self.set_state(CommandState::Rows);
                    return Rows::open(self.clone()).map(Some);
                }
                ResultType::CmdSucceed | ResultType::CmdDone => {
                    let count = self
                        .transport
                        .res_info(self.handle, ResInfo::RowCount)
                        .map_err(|code| DriverError::transport(code, "ct_res_info(CS_ROW_COUNT)"))?;
                    result.add(count);
                }
                ResultType::Describe => {}
                other => {
                    return Err(DriverError::ProtocolViolation(format!(
                        "unexpected result type {:?}",
                        other
                    )))
                }
            }
        }
        Ok(None)
    }

    /// Advance to the next result phase, `None` once the response ends.
    ///
    /// A failed `ct_results` call and a server-side command failure are
    /// both errors. Nothing is cancelled here.
    pub(crate) fn next_phase(&self) -> Result<Option<ResultType>> {
        let (code, kind) = self.transport.results(self.handle);
        match code {
            RetCode::EndResults => Ok(None),
            RetCode::Succeed | RetCode::Warning if kind == ResultType::CmdFail => Err(
                DriverError::transport(RetCode::Fail, "ct_results: command failed on the server"),
            ),
            RetCode::Succeed | RetCode::Warning => Ok(Some(kind)),
            other => Err(DriverError::transport(other, "ct_results")),
        }
    }

    /// Number of columns or parameters in the current phase.
    pub(crate) fn num_data(&self) -> Result<usize> {
        let count = self
            .transport
            .res_info(self.handle, ResInfo::NumData)
            .map_err(|code| DriverError::transport(code, "ct_res_info(CS_NUMDATA)"))?;
        usize::try_from(count).map_err(|_| {
            DriverError::ProtocolViolation(format!("negative item count {}", count))
        })
    }

    /// Cancel what is left of the response and fall back to the idle
    /// state: `Prepared` for dynamic commands, `Done` otherwise.
    pub(crate) fn abandon_response(&self) {
        self.cancel_quietly(CancelKind::All);
        if !self.is_closed() {
            self.set_state(if self.dynamic {
                CommandState::Prepared
            } else {
                CommandState::Done
            });
        }
    }

    /// Consume the whole response, closing any result set produced.
    pub(crate) fn drain(self: &Arc<Self>) -> Result<ExecResult> {
        let mut total = ExecResult::default();
        loop {
            let (rows, result) = self.consume_response()?;
            total.rows_affected += result.rows_affected;
            match rows {
                Some(mut rows) => {
                    while rows.skip()? {}
                    rows.detach();
                }
                None => return Ok(total),
            }
        }
    }

    pub fn cancel(&self, kind: CancelKind) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.transport.cancel(self.handle, kind).check("ct_cancel")
    }

    pub(crate) fn cancel_quietly(&self, kind: CancelKind) {
        if let Err(err) = self.cancel(kind) {
            warn!(error = %err, "failed to cancel pending results");
        }
    }

    /// Release the native handle. A direct command cancels pending results
    /// first. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == CommandState::Closed {
                return Ok(());
            }
            *state = CommandState::Closed;
        }

        let cancelled = if self.dynamic {
            Ok(())
        } else {
            self.transport
                .cancel(self.handle, CancelKind::All)
                .check("ct_cancel")
        };
        let dropped = self.transport.command_drop(self.handle).check("ct_cmd_drop");
        debug!(command = self.handle.0, dynamic = self.dynamic, "dropped command");
        cancelled.and(dropped)
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(err) = self.close() {
                warn!(error = %err, "failed to drop command");
            }
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("handle", &self.handle)
            .field("dynamic", &self.dynamic)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
