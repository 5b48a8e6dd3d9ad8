//! Out-of-band diagnostic messages and their fan-out to handlers.
//!
//! The native library raises server messages (PRINT output, warnings,
//! errors reported by the server) and client messages (raised by the
//! library itself) while a request is in flight. The [`MessageBroker`]
//! relays each one to every handler registered for its origin.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

/// Severity of purely informational server messages (`CS_SV_INFORM`).
pub const SEVERITY_INFORM: i64 = 10;

// ============================================================================
// Messages
// ============================================================================

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerMessage {
    pub number: u64,
    pub state: i64,
    pub severity: i64,
    pub text: String,
    pub server: String,
    pub procedure: String,
    pub line: i64,
    pub sqlstate: String,
}

/// A message generated by the client library.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientMessage {
    pub severity: i64,
    pub number: u64,
    pub text: String,
    pub os_number: i64,
    pub os_string: String,
    pub status: i64,
    pub sqlstate: String,
}

/// Where a message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOrigin {
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Server(ServerMessage),
    Client(ClientMessage),
}

impl Message {
    pub fn origin(&self) -> MessageOrigin {
        match self {
            Message::Server(_) => MessageOrigin::Server,
            Message::Client(_) => MessageOrigin::Client,
        }
    }

    pub fn number(&self) -> u64 {
        match self {
            Message::Server(msg) => msg.number,
            Message::Client(msg) => msg.number,
        }
    }

    pub fn severity(&self) -> i64 {
        match self {
            Message::Server(msg) => msg.severity,
            Message::Client(msg) => msg.severity,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Message::Server(msg) => &msg.text,
            Message::Client(msg) => &msg.text,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Server(msg) => write!(
                f,
                "Msg {}, Level {}, State {}: {}",
                msg.number, msg.severity, msg.state, msg.text
            ),
            Message::Client(msg) => write!(
                f,
                "Client message {}, Severity {}: {}",
                msg.number, msg.severity, msg.text
            ),
        }
    }
}

impl From<ServerMessage> for Message {
    fn from(msg: ServerMessage) -> Self {
        Message::Server(msg)
    }
}

impl From<ClientMessage> for Message {
    fn from(msg: ClientMessage) -> Self {
        Message::Client(msg)
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Callback receiving dispatched messages.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Ordered handler lists, one per message origin.
#[derive(Default)]
pub struct MessageBroker {
    server: RwLock<Vec<MessageHandler>>,
    client: RwLock<Vec<MessageHandler>>,
}

impl MessageBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers(&self, origin: MessageOrigin) -> &RwLock<Vec<MessageHandler>> {
        match origin {
            MessageOrigin::Server => &self.server,
            MessageOrigin::Client => &self.client,
        }
    }

    /// Append a handler for messages of `origin`.
    pub fn register_handler<F>(&self, origin: MessageOrigin, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.handlers(origin).write().push(Arc::new(handler));
    }

    /// Invoke every handler registered for the message's origin, in
    /// registration order.
    pub fn dispatch(&self, message: &Message) {
        // Snapshot so a handler may register further handlers without deadlocking.
        let handlers: Vec<MessageHandler> = self.handlers(message.origin()).read().clone();
        for handler in handlers {
            handler(message);
        }
    }

    pub fn handler_count(&self, origin: MessageOrigin) -> usize {
        self.handlers(origin).read().len()
    }
}

impl fmt::Debug for MessageBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBroker")
            .field("server_handlers", &self.handler_count(MessageOrigin::Server))
            .field("client_handlers", &self.handler_count(MessageOrigin::Client))
            .finish()
    }
}

// ============================================================================
// Built-in handlers
// ============================================================================

/// Log a server message through `tracing`. Informational messages are
/// logged at info level, everything else as a warning.
pub fn log_server_message(message: &Message) {
    if let Message::Server(msg) = message {
        if msg.severity <= SEVERITY_INFORM {
            info!(
                number = msg.number,
                severity = msg.severity,
                state = msg.state,
                server = %msg.server,
                procedure = %msg.procedure,
                line = msg.line,
                "{}",
                msg.text.trim_end()
            );
        } else {
            warn!(
                number = msg.number,
                severity = msg.severity,
                state = msg.state,
                server = %msg.server,
                procedure = %msg.procedure,
                line = msg.line,
                sqlstate = %msg.sqlstate,
                "{}",
                msg.text.trim_end()
            );
        }
    }
}

/// Log a client library message through `tracing`.
pub fn log_client_message(message: &Message) {
    if let Message::Client(msg) = message {
        warn!(
            number = msg.number,
            severity = msg.severity,
            os_number = msg.os_number,
            os_string = %msg.os_string,
            status = msg.status,
            sqlstate = %msg.sqlstate,
            "{}",
            msg.text.trim_end()
        );
    }
}

/// Collects message texts, e.g. the output of `dbcc` commands routed to
/// the client with trace flag 3604.
#[derive(Debug, Default, Clone)]
pub struct MessageRecorder {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MessageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the text of a message, newline terminated.
    pub fn handle_message(&self, message: &Message) {
        let mut line = message.text().to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.lines.lock().push(line);
    }

    /// Handler closure suitable for [`MessageBroker::register_handler`].
    pub fn handler(&self) -> impl Fn(&Message) + Send + Sync + 'static {
        let recorder = self.clone();
        move |message| recorder.handle_message(message)
    }

    /// Lines recorded since creation or the last reset.
    pub fn text(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn reset(&self) {
        self.lines.lock().clear();
    }
}
