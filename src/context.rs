//! Reference-counted library context shared by connections.
//!
//! The native library needs one initialized context before any session can
//! be allocated. Connections register with [`SessionContext::acquire`] and
//! deregister with [`SessionContext::release`]; the context is set up when
//! the first connection arrives and torn down when the last one leaves.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{DriverError, Result};
use crate::messages::{log_client_message, log_server_message, MessageBroker, MessageOrigin};
use crate::transport::{ContextHandle, Transport};

#[derive(Debug, Default)]
struct ContextState {
    /// Present iff `connections > 0` (or while the first acquire initializes).
    handle: Option<ContextHandle>,
    connections: usize,
    log_handlers_registered: bool,
}

/// Shared library context with a connection count.
pub struct SessionContext {
    transport: Arc<dyn Transport>,
    broker: Arc<MessageBroker>,
    log_client_msgs: bool,
    log_server_msgs: bool,
    state: Mutex<ContextState>,
}

impl SessionContext {
    pub fn new(transport: Arc<dyn Transport>, broker: Arc<MessageBroker>) -> Self {
        Self {
            transport,
            broker,
            log_client_msgs: false,
            log_server_msgs: false,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// Register `tracing` handlers for client and/or server messages on the
    /// first initialization.
    pub fn with_message_logging(mut self, client: bool, server: bool) -> Self {
        self.log_client_msgs = client;
        self.log_server_msgs = server;
        self
    }

    #[inline]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[inline]
    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    /// Number of connections currently registered.
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// Register a connection, initializing the context if it is the first.
    ///
    /// On failure the count is unchanged and nothing stays allocated.
    pub fn acquire(&self) -> Result<ContextHandle> {
        let mut state = self.state.lock();
        let handle = match state.handle {
            Some(handle) => handle,
            None => {
                let handle = self.initialize()?;
                if !state.log_handlers_registered {
                    self.register_log_handlers();
                    state.log_handlers_registered = true;
                }
                state.handle = Some(handle);
                handle
            }
        };
        state.connections += 1;
        Ok(handle)
    }

    /// Deregister a connection, tearing the context down if it was the last.
    ///
    /// Teardown errors are returned but the handle is cleared regardless.
    pub fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.connections == 0 {
            return Err(DriverError::ResourceMisuse(
                "context released more often than acquired".to_string(),
            ));
        }
        state.connections -= 1;
        if state.connections > 0 {
            return Ok(());
        }

        let Some(handle) = state.handle.take() else {
            return Ok(());
        };
        debug!(context = handle.0, "tearing down library context");
        let exit = self.transport.context_exit(handle).check("ct_exit");
        let drop = self.transport.context_drop(handle).check("cs_ctx_drop");
        exit.and(drop)
    }

    fn initialize(&self) -> Result<ContextHandle> {
        let handle = self
            .transport
            .context_alloc()
            .map_err(|code| DriverError::transport(code, "cs_ctx_alloc"))?;

        if let Err(err) = self.transport.context_init(handle).check("ct_init") {
            if let Err(drop_err) = self.transport.context_drop(handle).check("cs_ctx_drop") {
                warn!(error = %drop_err, "failed to drop context after init failure");
            }
            return Err(err);
        }

        if let Err(err) = self
            .transport
            .set_message_callbacks(handle, self.broker.clone())
            .check("ct_callback")
        {
            let cleanup = self
                .transport
                .context_exit(handle)
                .check("ct_exit")
                .and(self.transport.context_drop(handle).check("cs_ctx_drop"));
            if let Err(cleanup_err) = cleanup {
                warn!(error = %cleanup_err, "failed to release context after callback failure");
            }
            return Err(err);
        }

        debug!(context = handle.0, "initialized library context");
        Ok(handle)
    }

    fn register_log_handlers(&self) {
        if self.log_client_msgs {
            self.broker
                .register_handler(MessageOrigin::Client, log_client_message);
        }
        if self.log_server_msgs {
            self.broker
                .register_handler(MessageOrigin::Server, log_server_message);
        }
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionContext")
            .field("handle", &state.handle)
            .field("connections", &state.connections)
            .finish()
    }
}
