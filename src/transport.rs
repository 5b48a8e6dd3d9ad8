//! Boundary to the native client library.
//!
//! The core never performs network I/O itself. Everything that touches the
//! server goes through the [`Transport`] trait, whose primitives mirror the
//! request/response calls of Client-Library: allocate, set properties,
//! send, read results, describe, bind, fetch, cancel, drop. Every primitive
//! blocks and reports a [`RetCode`].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{DriverError, Result};
use crate::messages::MessageBroker;

// ============================================================================
// Status codes
// ============================================================================

/// Status returned by a transport primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetCode {
    /// Operation completed.
    Succeed,
    /// Operation proceeded with a caveat; not an error by itself.
    Warning,
    /// Operation-local failure.
    Fail,
    /// Normal end of a result set.
    EndData,
    /// A fetched row is unusable, the cursor may continue.
    RowFail,
    /// No more result phases for the current command.
    EndResults,
    /// The operation was cancelled by the library.
    Canceled,
    /// Any other library specific code.
    Other(i32),
}

impl RetCode {
    /// Numeric value as used by the native library.
    pub fn code(self) -> i32 {
        match self {
            RetCode::Succeed => 1,
            RetCode::Fail => 0,
            RetCode::Warning => 2,
            RetCode::Canceled => -202,
            RetCode::RowFail => -203,
            RetCode::EndData => -204,
            RetCode::EndResults => -205,
            RetCode::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => RetCode::Succeed,
            0 => RetCode::Fail,
            2 => RetCode::Warning,
            -202 => RetCode::Canceled,
            -203 => RetCode::RowFail,
            -204 => RetCode::EndData,
            -205 => RetCode::EndResults,
            other => RetCode::Other(other),
        }
    }

    /// `Succeed` and `Warning` are the only non-error outcomes.
    #[inline]
    pub fn is_ok(self) -> bool {
        matches!(self, RetCode::Succeed | RetCode::Warning)
    }

    /// Map a status to `Ok(())` or a transport error labelled with `operation`.
    #[inline]
    pub fn check(self, operation: &str) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(DriverError::transport(self, operation))
        }
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetCode::Succeed => write!(f, "CS_SUCCEED"),
            RetCode::Warning => write!(f, "CS_WARNING"),
            RetCode::Fail => write!(f, "CS_FAIL"),
            RetCode::EndData => write!(f, "CS_END_DATA"),
            RetCode::RowFail => write!(f, "CS_ROW_FAIL"),
            RetCode::EndResults => write!(f, "CS_END_RESULTS"),
            RetCode::Canceled => write!(f, "CS_CANCELED"),
            RetCode::Other(code) => write!(f, "{}", code),
        }
    }
}

/// Kind of result phase reported by [`Transport::results`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Row,
    Param,
    Status,
    Compute,
    Describe,
    CmdSucceed,
    CmdDone,
    CmdFail,
    Other(i32),
}

impl ResultType {
    /// Phases that carry fetchable rows.
    pub fn has_rows(self) -> bool {
        matches!(
            self,
            ResultType::Row | ResultType::Param | ResultType::Status | ResultType::Compute
        )
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Opaque handle of an initialized library context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Opaque handle of a session (connection) resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Opaque handle of a command resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(pub u64);

// ============================================================================
// Descriptors
// ============================================================================

/// Framing applied by the library when copying character/binary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatFlag {
    /// Native layout of the type.
    #[default]
    Unused,
    /// Data is followed by a NUL terminator.
    NullTerm,
    /// Data is padded with NUL bytes up to the maximum length.
    PadNull,
}

/// Status bits of a data format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    pub const NONE: StatusFlags = StatusFlags(0);
    pub const KEY: StatusFlags = StatusFlags(0x2);
    pub const CAN_BE_NULL: StatusFlags = StatusFlags(0x20);
    pub const INPUT_VALUE: StatusFlags = StatusFlags(0x100);
    pub const UPDATABLE: StatusFlags = StatusFlags(0x200);
    pub const IDENTITY: StatusFlags = StatusFlags(0x2000);

    #[inline]
    pub fn contains(self, other: StatusFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn with(self, other: StatusFlags) -> StatusFlags {
        StatusFlags(self.0 | other.0)
    }
}

/// Description of a column or parameter (`CS_DATAFMT`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataFormat {
    pub name: String,
    /// Raw type code; converted to a [`crate::types::TypeTag`] by the core.
    pub datatype: i32,
    pub format: FormatFlag,
    pub maxlength: i32,
    pub scale: i32,
    pub precision: i32,
    pub status: StatusFlags,
}

/// One encoded parameter ready to be handed to [`Transport::param`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamData {
    pub format: DataFormat,
    /// `None` sends NULL.
    pub data: Option<Bytes>,
    /// Explicit data length, `None` for fixed-size types.
    pub datalen: Option<usize>,
}

/// Receive buffer of one result column.
///
/// The library copies each fetched value into `data` and records the
/// number of bytes written in `copied` and a negative `indicator` for NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBuffer {
    pub data: Vec<u8>,
    pub copied: usize,
    pub indicator: i16,
}

impl ColumnBuffer {
    pub fn with_capacity(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
            copied: 0,
            indicator: 0,
        }
    }

    /// Bytes written by the last fetch.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.copied.min(self.data.len())]
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.indicator < 0
    }
}

/// Session properties set before connecting (or toggled afterwards).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionProperty {
    ExtendedEncryption(bool),
    NonEncryptionRetry(bool),
    UserStoreKey(String),
    Username(String),
    Password(String),
    ServerAddr(String),
    AppName(String),
    ReadOnly(bool),
}

impl SessionProperty {
    /// Native property name, used as the operation label of errors.
    pub fn label(&self) -> &'static str {
        match self {
            SessionProperty::ExtendedEncryption(_) => "CS_SEC_EXTENDED_ENCRYPTION",
            SessionProperty::NonEncryptionRetry(_) => "CS_SEC_NON_ENCRYPTION_RETRY",
            SessionProperty::UserStoreKey(_) => "CS_SECSTOREKEY",
            SessionProperty::Username(_) => "CS_USERNAME",
            SessionProperty::Password(_) => "CS_PASSWORD",
            SessionProperty::ServerAddr(_) => "CS_SERVERADDR",
            SessionProperty::AppName(_) => "CS_APPNAME",
            SessionProperty::ReadOnly(_) => "CS_PROP_READONLY",
        }
    }
}

/// Operation of a dynamic (prepared) statement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicOp {
    Prepare,
    DescribeInput,
    Execute,
    Dealloc,
}

/// Scope of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    All,
    Current,
}

/// Information queried from the current result phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResInfo {
    /// Number of columns or described parameters.
    NumData,
    /// Rows affected by the last command.
    RowCount,
}

// ============================================================================
// Transport
// ============================================================================

/// Blocking request/response primitives of the native client library.
///
/// Column and parameter items are addressed zero-based.
pub trait Transport: Send + Sync + 'static {
    fn context_alloc(&self) -> std::result::Result<ContextHandle, RetCode>;
    fn context_init(&self, ctx: ContextHandle) -> RetCode;
    /// Route server and client messages raised under `ctx` to `broker`.
    fn set_message_callbacks(&self, ctx: ContextHandle, broker: Arc<MessageBroker>) -> RetCode;
    fn context_exit(&self, ctx: ContextHandle) -> RetCode;
    fn context_drop(&self, ctx: ContextHandle) -> RetCode;

    fn session_alloc(&self, ctx: ContextHandle) -> std::result::Result<SessionHandle, RetCode>;
    fn set_property(&self, session: SessionHandle, property: &SessionProperty) -> RetCode;
    fn read_only(&self, session: SessionHandle) -> std::result::Result<bool, RetCode>;
    fn connect(&self, session: SessionHandle) -> RetCode;
    fn session_cancel(&self, session: SessionHandle) -> RetCode;
    fn session_close(&self, session: SessionHandle) -> RetCode;
    fn session_drop(&self, session: SessionHandle) -> RetCode;

    fn command_alloc(&self, session: SessionHandle) -> std::result::Result<CommandHandle, RetCode>;
    /// Initiate a language command carrying `text`.
    fn language(&self, cmd: CommandHandle, text: &str) -> RetCode;
    fn dynamic(&self, cmd: CommandHandle, op: DynamicOp, name: &str, text: Option<&str>)
        -> RetCode;
    fn param(&self, cmd: CommandHandle, param: &ParamData) -> RetCode;
    fn send(&self, cmd: CommandHandle) -> RetCode;
    fn results(&self, cmd: CommandHandle) -> (RetCode, ResultType);
    fn res_info(&self, cmd: CommandHandle, info: ResInfo) -> std::result::Result<i32, RetCode>;
    fn describe(&self, cmd: CommandHandle, item: usize) -> std::result::Result<DataFormat, RetCode>;
    fn bind(&self, cmd: CommandHandle, item: usize, format: &DataFormat) -> RetCode;
    /// Fetch the next row into the buffers bound for the current result set.
    fn fetch(&self, cmd: CommandHandle, buffers: &mut [ColumnBuffer]) -> RetCode;
    fn cancel(&self, cmd: CommandHandle, kind: CancelKind) -> RetCode;
    fn command_drop(&self, cmd: CommandHandle) -> RetCode;
}
