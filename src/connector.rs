//! Connection factory and cancellable blocking work.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ConnectionInfo;
use crate::connection::Connection;
use crate::context::SessionContext;
use crate::error::{DriverError, Result};
use crate::messages::MessageBroker;
use crate::transport::Transport;

/// Opens connections for one [`ConnectionInfo`], all sharing one context
/// and one message broker.
#[derive(Debug, Clone)]
pub struct Connector {
    info: ConnectionInfo,
    context: Arc<SessionContext>,
}

impl Connector {
    pub fn new(transport: Arc<dyn Transport>, info: ConnectionInfo) -> Self {
        Self::with_broker(transport, info, Arc::new(MessageBroker::new()))
    }

    /// Use an existing broker, e.g. one shared with other connectors.
    pub fn with_broker(
        transport: Arc<dyn Transport>,
        info: ConnectionInfo,
        broker: Arc<MessageBroker>,
    ) -> Self {
        let context = SessionContext::new(transport, broker)
            .with_message_logging(info.log_client_msgs, info.log_server_msgs);
        Self {
            info,
            context: Arc::new(context),
        }
    }

    /// Build a connector and verify it by opening and closing one
    /// connection, so unreachable servers and bad credentials fail here.
    pub fn open(transport: Arc<dyn Transport>, info: ConnectionInfo) -> Result<Self> {
        let connector = Self::new(transport, info);
        let connection = connector.connect_blocking()?;
        if let Err(err) = connection.close() {
            warn!(error = %err, "failed to close verification connection");
        }
        debug!(server = %connector.info.host, "verified connector");
        Ok(connector)
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        self.context.broker()
    }

    /// Open a connection on the current thread.
    pub fn connect_blocking(&self) -> Result<Connection> {
        Connection::open(self.context.clone(), &self.info)
    }

    /// Open a connection on a blocking worker, giving up when `cancel`
    /// completes first.
    ///
    /// A connection that completes after cancellation is closed in the
    /// background.
    pub async fn connect<F>(&self, cancel: F) -> Result<Connection>
    where
        F: Future<Output = ()>,
    {
        let context = self.context.clone();
        let info = self.info.clone();
        run_cancellable(
            move || Connection::open(context, &info),
            |connection: Connection| {
                if let Err(err) = connection.close() {
                    warn!(error = %err, "failed to close abandoned connection");
                }
            },
            cancel,
        )
        .await
    }
}

/// Run blocking `work` on the blocking pool and race it against `cancel`.
///
/// Completion is polled first. When `cancel` wins the caller gets
/// [`DriverError::Cancelled`] right away while the worker keeps running;
/// if it then produces a value, `cleanup` disposes of it on the blocking
/// pool. The cleanup only ever sees fully constructed values.
pub(crate) async fn run_cancellable<T, W, C, F>(work: W, cleanup: C, cancel: F) -> Result<T>
where
    T: Send + 'static,
    W: FnOnce() -> Result<T> + Send + 'static,
    C: FnOnce(T) + Send + 'static,
    F: Future<Output = ()>,
{
    let mut task = tokio::task::spawn_blocking(work);

    tokio::select! {
        biased;
        joined = &mut task => joined.map_err(|err| DriverError::Worker(err.to_string()))?,
        _ = cancel => {
            tokio::spawn(async move {
                match task.await {
                    Ok(Ok(value)) => {
                        debug!("disposing of result completed after cancellation");
                        if let Err(err) = tokio::task::spawn_blocking(move || cleanup(value)).await {
                            warn!(error = %err, "cleanup worker failed");
                        }
                    }
                    Ok(Err(err)) => debug!(error = %err, "cancelled operation failed"),
                    Err(err) => warn!(error = %err, "cancelled worker failed"),
                }
            });
            Err(DriverError::Cancelled)
        }
    }
}
