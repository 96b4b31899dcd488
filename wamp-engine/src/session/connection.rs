use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use log::{
    error,
    info,
    warn,
};
use tokio::task::JoinHandle;

use crate::{
    dispatch::{
        dispatcher::Dispatcher,
        flow::DispatchStatus,
    },
    session::session::Session,
    transport::transport::Transport,
};

/// Configuration for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to wait before redelivering a message that could not be handled.
    pub busy_backoff: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            busy_backoff: Duration::from_millis(10),
        }
    }
}

/// A handle to a running connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    session: Arc<Session>,
    join_handle: JoinHandle<()>,
}

impl ConnectionHandle {
    /// The session driven by the connection.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Checks if the connection loop finished.
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Waits for the connection loop to finish.
    pub async fn join(self) -> Result<()> {
        self.join_handle.await.map_err(Error::new)
    }
}

/// A connection drives one session over one transport.
///
/// Inbound messages are pumped into the dispatcher one at a time. When the session closes or the
/// transport ends, the session is torn down and the transport is closed.
pub struct Connection {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    config: ConnectionConfig,
}

impl Connection {
    /// Creates a new connection.
    pub fn new(
        session: Arc<Session>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            session,
            transport,
            dispatcher,
            config,
        }
    }

    /// Starts the connection on the runtime.
    pub fn start(self) -> ConnectionHandle {
        let session = self.session.clone();
        let join_handle = tokio::spawn(self.run());
        ConnectionHandle {
            session,
            join_handle,
        }
    }

    async fn run(self) {
        self.message_loop().await;

        if let Err(err) = self.session.close_now().await {
            error!(
                "Failed to close session {} after its connection ended: {err:#}",
                self.session.name()
            );
        }
        if let Err(err) = self.transport.close().await {
            error!(
                "Failed to close transport for session {}: {err:#}",
                self.session.name()
            );
        }
        info!("Connection for session {} finished", self.session.name());
    }

    async fn message_loop(&self) {
        loop {
            let message = tokio::select! {
                message = self.transport.receive() => message,
                _ = self.session.closed() => break,
            };
            let message = match message {
                Some(message) => message,
                None => {
                    info!(
                        "Transport for session {} ended",
                        self.session.name()
                    );
                    break;
                }
            };

            match self.dispatcher.dispatch(&self.session, &message).await {
                Ok(DispatchStatus::Busy) => {
                    if let Err(err) = self.transport.unreceive(message) {
                        error!(
                            "Failed to push back message for session {}: {err:#}",
                            self.session.name()
                        );
                    }
                    tokio::time::sleep(self.config.busy_backoff).await;
                }
                Ok(DispatchStatus::Failed) => {
                    warn!(
                        "Session {} dropped {} message",
                        self.session.name(),
                        message.message_name()
                    );
                }
                Ok(_) => (),
                Err(err) => {
                    error!(
                        "Session {} failed to handle message: {err:#}",
                        self.session.name()
                    );
                    if !self.transport.is_open() {
                        break;
                    }
                }
            }
        }
    }
}
