//! Client-side driver core for SAP ASE.
//!
//! The crate drives a native client library (modelled by the [`Transport`]
//! trait) through sessions, commands and result sets, and converts values
//! between the driver's [`Value`] model and the server's native types.
//!
//! Architecture:
//! - `transport`: blocking primitives of the native library
//! - `context`: reference-counted library context shared by connections
//! - `connection`: sessions, direct execution and value checking
//! - `command`: request/response state machine and the response loop
//! - `statement`: server-side prepared statements
//! - `rows`: result set cursor and column metadata
//! - `types`: type tags, values and the byte-level codec
//! - `transaction`: transactions with read-only restoration
//! - `messages`: server/client message broker
//! - `connector`: connection factory and cancellable operations
//! - `config`: connection configuration

pub mod command;
pub mod config;
pub mod connection;
pub mod connector;
pub mod context;
pub mod error;
pub mod messages;
pub mod rows;
pub mod statement;
pub mod transaction;
pub mod transport;
pub mod types;

#[cfg(test)]
mod mock;

pub use command::{Command, CommandState, ExecResult};
pub use config::ConnectionInfo;
pub use connection::Connection;
pub use connector::Connector;
pub use context::SessionContext;
pub use error::{DriverError, Result};
pub use messages::{
    ClientMessage, Message, MessageBroker, MessageOrigin, MessageRecorder, ServerMessage,
};
pub use rows::{ColumnDescriptor, Rows};
pub use statement::Statement;
pub use transaction::{IsolationLevel, Transaction, TxOptions};
pub use transport::{RetCode, Transport};
pub use types::{Decimal, TypeTag, Value};
