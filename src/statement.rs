//! Server-side prepared statements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::command::{Command, CommandState, ExecResult};
use crate::connection::Connection;
use crate::error::{DriverError, Result};
use crate::rows::Rows;
use crate::transport::{CancelKind, DynamicOp, ParamData, ResultType};
use crate::types::codec;
use crate::types::{TypeTag, Value};

/// Described parameter types; most statements have only a few.
pub type ParamTypes = SmallVec<[TypeTag; 8]>;

static STATEMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique statement name (`stmt1`, `stmt2`, ...).
pub(crate) fn next_statement_name() -> String {
    let id = STATEMENT_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("stmt{}", id)
}

/// A statement prepared on the server, executable any number of times.
#[derive(Debug)]
pub struct Statement {
    name: String,
    query: String,
    arg_count: usize,
    command: Arc<Command>,
    param_types: ParamTypes,
    /// Set once the server knows the statement and it must be deallocated.
    prepared: bool,
    closed: bool,
}

impl Statement {
    /// Prepare `query` and describe its input parameters.
    pub(crate) fn prepare(connection: &Connection, query: &str) -> Result<Statement> {
        let name = next_statement_name();
        let command = Command::dynamic(connection, &name)?;
        let mut statement = Statement {
            arg_count: query.matches('?').count(),
            name,
            query: query.to_string(),
            command,
            param_types: ParamTypes::new(),
            prepared: false,
            closed: false,
        };

        if let Err(err) = statement.prepare_on_server() {
            if let Err(close_err) = statement.close() {
                warn!(error = %close_err, "failed to clean up after prepare failure");
            }
            return Err(err);
        }

        debug!(
            statement = %statement.name,
            params = statement.arg_count,
            "prepared statement"
        );
        Ok(statement)
    }

    fn prepare_on_server(&mut self) -> Result<()> {
        let transport = self.command.transport().clone();
        let handle = self.command.handle();

        self.command.set_state(CommandState::Preparing);
        transport
            .dynamic(handle, DynamicOp::Prepare, &self.name, Some(self.query.as_str()))
            .check("ct_dynamic(CS_PREPARE)")?;
        self.command.send()?;
        self.prepared = true;

        let (rows, _) = self.command.consume_response()?;
        if let Some(mut rows) = rows {
            if let Err(err) = rows.close() {
                warn!(statement = %self.name, error = %err, "failed to close unexpected rows");
            }
            return Err(DriverError::ProtocolViolation(
                "received rows when preparing a statement".to_string(),
            ));
        }

        self.describe_input()?;
        self.command.set_state(CommandState::Prepared);
        Ok(())
    }

    fn describe_input(&mut self) -> Result<()> {
        self.command
            .transport()
            .dynamic(self.command.handle(), DynamicOp::DescribeInput, &self.name, None)
            .check("ct_dynamic(CS_DESCRIBE_INPUT)")?;
        self.command.send()?;

        match self.read_param_types() {
            Ok(Some(types)) => {
                self.arg_count = types.len();
                self.param_types = types;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                self.command.abandon_response();
                Err(err)
            }
        }
    }

    fn read_param_types(&self) -> Result<Option<ParamTypes>> {
        let transport = self.command.transport();
        let handle = self.command.handle();
        let mut described = None;

        while let Some(kind) = self.command.next_phase()? {
            if kind != ResultType::Describe {
                continue;
            }
            let count = self.command.num_data()?;
            let mut types = ParamTypes::with_capacity(count);
            for item in 0..count {
                let format = transport
                    .describe(handle, item)
                    .map_err(|code| DriverError::transport(code, format!("ct_describe({})", item)))?;
                let tag = TypeTag::from_code(format.datatype).ok_or_else(|| {
                    DriverError::UnsupportedType(format!(
                        "parameter {} has unknown type code {}",
                        item, format.datatype
                    ))
                })?;
                types.push(tag);
            }
            described = Some(types);
        }
        Ok(described)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Statement text as prepared.
    pub fn sql(&self) -> &str {
        &self.query
    }

    /// Number of input parameters.
    #[inline]
    pub fn num_input(&self) -> usize {
        self.arg_count
    }

    pub fn param_types(&self) -> &[TypeTag] {
        &self.param_types
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// State of the underlying dynamic command.
    pub fn state(&self) -> CommandState {
        self.command.state()
    }

    /// Convert `value` for the parameter at the 1-based `ordinal`.
    pub fn check_value(&self, ordinal: usize, value: Value) -> Result<Value> {
        if ordinal == 0 || ordinal > self.param_types.len() {
            return Err(DriverError::ArgumentMismatch(format!(
                "ordinal {} outside 1..={}",
                ordinal,
                self.param_types.len()
            )));
        }
        codec::convert(self.param_types[ordinal - 1], value)
    }

    fn encode_args(&self, args: &[Value]) -> Result<Vec<ParamData>> {
        if self.closed {
            return Err(DriverError::ResourceMisuse(format!(
                "statement {} is closed",
                self.name
            )));
        }
        if args.len() != self.arg_count {
            return Err(DriverError::ArgumentMismatch(format!(
                "expected {} arguments, got {}",
                self.arg_count,
                args.len()
            )));
        }
        if self.param_types.len() != self.arg_count {
            return Err(DriverError::ProtocolViolation(format!(
                "statement {} has {} described parameters for {} placeholders",
                self.name,
                self.param_types.len(),
                self.arg_count
            )));
        }
        args.iter()
            .zip(self.param_types.iter())
            .map(|(arg, tag)| codec::encode_param(*tag, arg))
            .collect()
    }

    /// Execute with `args`, returning the first result set if any.
    ///
    /// The argument count and every conversion are checked before anything
    /// is sent.
    pub fn exec(&self, args: &[Value]) -> Result<(Option<Rows>, ExecResult)> {
        let params = self.encode_args(args)?;
        let transport = self.command.transport().clone();
        let handle = self.command.handle();

        self.command.set_state(CommandState::Executing);
        transport
            .dynamic(handle, DynamicOp::Execute, &self.name, None)
            .check("ct_dynamic(CS_EXECUTE)")?;
        for (i, param) in params.iter().enumerate() {
            transport
                .param(handle, param)
                .check(&format!("ct_param({})", i))?;
        }
        self.command.send()?;
        self.command.consume_response()
    }

    /// Execute expecting a result set.
    pub fn query(&self, args: &[Value]) -> Result<Rows> {
        match self.exec(args)? {
            (Some(rows), _) => Ok(rows),
            (None, _) => Err(DriverError::ProtocolViolation(
                "statement produced no result set".to_string(),
            )),
        }
    }

    /// Execute, discarding any result set.
    pub fn execute(&self, args: &[Value]) -> Result<ExecResult> {
        let (rows, result) = self.exec(args)?;
        if let Some(mut rows) = rows {
            rows.close()?;
        }
        Ok(result)
    }

    /// Deallocate the statement on the server and drop its command.
    /// Results still pending from open rows are cancelled first. Closing
    /// twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.command.state() == CommandState::Rows {
            self.command.cancel_quietly(CancelKind::All);
        }

        let dealloc = if self.prepared && !self.command.is_closed() {
            self.deallocate()
        } else {
            Ok(())
        };
        let dropped = self.command.close();
        debug!(statement = %self.name, "closed statement");
        dealloc.and(dropped)
    }

    fn deallocate(&self) -> Result<()> {
        self.command
            .transport()
            .dynamic(self.command.handle(), DynamicOp::Dealloc, &self.name, None)
            .check("ct_dynamic(CS_DEALLOC)")?;
        self.command.send()?;
        self.command.drain().map(|_| ())
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(statement = %self.name, error = %err, "failed to close statement");
        }
    }
}
