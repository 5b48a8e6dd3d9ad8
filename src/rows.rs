//! Cursor over a result set.
//!
//! [`Rows`] binds one receive buffer per column when it is opened, fetches
//! row by row and decodes each buffer through the codec entry of the
//! column's type. Buffers are released exactly once, by [`Rows::close`] or
//! on drop.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::warn;

use crate::command::{Command, CommandState};
use crate::error::{DriverError, Result};
use crate::statement::Statement;
use crate::transport::{CancelKind, ColumnBuffer, DataFormat, RetCode, StatusFlags};
use crate::types::codec::{self, CodecEntry};
use crate::types::{TypeTag, Value};

/// Description of one result column, fixed when the result set is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_tag: TypeTag,
    pub max_length: usize,
    pub precision: u8,
    pub scale: u8,
    pub nullable: bool,
    pub status: StatusFlags,
}

impl ColumnDescriptor {
    fn from_format(format: &DataFormat, type_tag: TypeTag) -> Self {
        Self {
            name: format.name.clone(),
            type_tag,
            max_length: usize::try_from(format.maxlength).unwrap_or(0),
            precision: u8::try_from(format.precision).unwrap_or(0),
            scale: u8::try_from(format.scale).unwrap_or(0),
            nullable: format.status.contains(StatusFlags::CAN_BE_NULL),
            status: format.status,
        }
    }

    /// Type name as reported to applications.
    pub fn type_name(&self) -> &'static str {
        self.type_tag.name()
    }
}

/// An open result set.
#[derive(Debug)]
pub struct Rows {
    command: Arc<Command>,
    descriptors: Vec<ColumnDescriptor>,
    entries: Vec<CodecEntry>,
    buffers: Vec<ColumnBuffer>,
    /// Temporary statement closed together with the rows.
    statement: Option<Statement>,
    exhausted: bool,
    closed: bool,
}

impl Rows {
    /// Describe and bind every column of the current result phase.
    pub(crate) fn open(command: Arc<Command>) -> Result<Rows> {
        let transport = command.transport().clone();
        let handle = command.handle();

        let count = command.num_data()?;
        if count == 0 {
            return Err(DriverError::ProtocolViolation(
                "result set without columns".to_string(),
            ));
        }

        let mut descriptors = Vec::with_capacity(count);
        let mut entries = Vec::with_capacity(count);
        let mut buffers = Vec::with_capacity(count);

        for item in 0..count {
            let described = transport
                .describe(handle, item)
                .map_err(|code| DriverError::transport(code, format!("ct_describe({})", item)))?;
            let entry = codec::entry_for_code(described.datatype)?;
            let len = entry.buffer_len(described.maxlength);

            let mut format = described.clone();
            format.format = entry.column_format;
            format.maxlength = len as i32;
            transport
                .bind(handle, item, &format)
                .check(&format!("ct_bind({})", item))?;

            descriptors.push(ColumnDescriptor::from_format(&described, entry.tag));
            entries.push(entry);
            buffers.push(ColumnBuffer::with_capacity(len));
        }

        Ok(Rows {
            command,
            descriptors,
            entries,
            buffers,
            statement: None,
            exhausted: false,
            closed: false,
        })
    }

    /// Close `statement` when these rows are closed.
    pub(crate) fn attach_statement(&mut self, statement: Statement) {
        self.statement = Some(statement);
    }

    #[inline]
    pub fn column_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn columns(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn descriptors(&self) -> &[ColumnDescriptor] {
        &self.descriptors
    }

    fn descriptor(&self, index: usize) -> Result<&ColumnDescriptor> {
        self.descriptors.get(index).ok_or_else(|| {
            DriverError::ArgumentMismatch(format!(
                "column {} out of range, result has {} columns",
                index,
                self.descriptors.len()
            ))
        })
    }

    pub fn column_type_name(&self, index: usize) -> Result<&'static str> {
        Ok(self.descriptor(index)?.type_name())
    }

    pub fn column_nullable(&self, index: usize) -> Result<bool> {
        Ok(self.descriptor(index)?.nullable)
    }

    /// Precision and scale of decimal columns, `None` for other types.
    pub fn column_precision_scale(&self, index: usize) -> Result<Option<(u8, u8)>> {
        let desc = self.descriptor(index)?;
        Ok(desc
            .type_tag
            .is_decimal()
            .then_some((desc.precision, desc.scale)))
    }

    /// Declared length of variable-length character and binary columns.
    pub fn column_length(&self, index: usize) -> Result<Option<usize>> {
        let desc = self.descriptor(index)?;
        let variable = desc.type_tag.is_character() || desc.type_tag.is_binary();
        Ok(variable.then_some(desc.max_length))
    }

    pub fn column_max_length(&self, index: usize) -> Result<usize> {
        Ok(self.descriptor(index)?.max_length)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fetch the next row into `dest`.
    ///
    /// Returns `Ok(false)` once the result set is exhausted; the rows are
    /// closed at that point. A value that fails to decode aborts the row
    /// and leaves `dest` untouched.
    pub fn next(&mut self, dest: &mut [Value]) -> Result<bool> {
        if self.closed {
            if self.exhausted {
                return Ok(false);
            }
            return Err(DriverError::ResourceMisuse("rows are closed".to_string()));
        }
        if dest.len() != self.column_count() {
            return Err(DriverError::ArgumentMismatch(format!(
                "destination holds {} values, result has {} columns",
                dest.len(),
                self.column_count()
            )));
        }

        if !self.fetch()? {
            self.close()?;
            return Ok(false);
        }

        let row = self
            .buffers
            .iter()
            .zip(&self.entries)
            .map(|(buffer, entry)| {
                if buffer.is_null() {
                    Ok(Value::Null)
                } else {
                    entry.decode(buffer.filled())
                }
            })
            .collect::<Result<SmallVec<[Value; 8]>>>()?;
        for (slot, value) in dest.iter_mut().zip(row) {
            *slot = value;
        }
        Ok(true)
    }

    /// Fetch the next row as a freshly allocated vector.
    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        let mut row = vec![Value::Null; self.column_count()];
        Ok(self.next(&mut row)?.then_some(row))
    }

    /// Collect every remaining row and close.
    pub fn collect_rows(mut self) -> Result<Vec<Vec<Value>>> {
        let mut out = Vec::new();
        while let Some(row) = self.next_row()? {
            out.push(row);
        }
        self.close()?;
        Ok(out)
    }

    /// Fetch and discard one row.
    pub(crate) fn skip(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        self.fetch()
    }

    fn fetch(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        let code = self
            .command
            .transport()
            .fetch(self.command.handle(), &mut self.buffers);
        match code {
            RetCode::Succeed | RetCode::Warning => Ok(true),
            RetCode::EndData => {
                self.exhausted = true;
                Ok(false)
            }
            other => Err(DriverError::transport(other, "ct_fetch")),
        }
    }

    /// Release the buffers without touching the command, leaving the
    /// response positioned after this result set.
    pub(crate) fn detach(&mut self) {
        self.closed = true;
        self.exhausted = true;
        self.buffers = Vec::new();
    }

    /// Close the result set.
    ///
    /// Cancels outstanding results, drops a direct command and closes an
    /// attached temporary statement. Every step runs; the first failure is
    /// returned. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffers = Vec::new();

        let mut result = self.command.cancel(CancelKind::All);
        if self.command.is_dynamic() {
            if !self.command.is_closed() {
                self.command.set_state(CommandState::Prepared);
            }
        } else {
            result = result.and(self.command.close());
        }
        if let Some(mut statement) = self.statement.take() {
            result = result.and(statement.close());
        }
        result
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close rows");
        }
    }
}
