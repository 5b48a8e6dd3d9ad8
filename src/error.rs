//! Error types for the driver core.
//!
//! Every failure is a variant of one closed enumeration so callers can
//! match on the kind instead of parsing messages.

use thiserror::Error;

use crate::transport::RetCode;
use crate::types::TypeTag;

#[derive(Error, Debug)]
pub enum DriverError {
    /// A transport primitive returned a non-success status.
    #[error("{operation} failed with return code {code}")]
    Transport { code: RetCode, operation: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Wrong argument count or an ordinal outside the parameter list.
    #[error("Argument mismatch: {0}")]
    ArgumentMismatch(String),

    /// A type code without a codec entry.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// Operation attempted on a closed or released resource.
    #[error("Resource misuse: {0}")]
    ResourceMisuse(String),

    #[error("Cannot convert value for {tag}: {reason}")]
    Conversion { tag: TypeTag, reason: String },

    #[error("Isolation level {0:?} is not supported")]
    UnsupportedIsolationLevel(crate::transaction::IsolationLevel),

    /// Health check verdict; the underlying cause is intentionally dropped.
    #[error("Connection is broken")]
    BadConnection,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Background worker failed: {0}")]
    Worker(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// Build a transport error from a status code and an operation label.
    pub fn transport(code: RetCode, operation: impl Into<String>) -> Self {
        DriverError::Transport {
            code,
            operation: operation.into(),
        }
    }

    pub(crate) fn conversion(tag: TypeTag, reason: impl Into<String>) -> Self {
        DriverError::Conversion {
            tag,
            reason: reason.into(),
        }
    }

    /// Status code carried by a transport error, if any.
    pub fn code(&self) -> Option<RetCode> {
        match self {
            DriverError::Transport { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
