use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::message::Message;

/// A bidirectional channel of already-decoded WAMP messages.
///
/// Byte framing and serialization live below this trait. A transport is shared between the task
/// that drives inbound messages and every actor that sends outbound messages, so all methods take
/// `&self`.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Sends a message to the remote end.
    ///
    /// Fails if the transport is closed or the message cannot be delivered.
    async fn send(&self, message: Message) -> Result<()>;

    /// Receives the next message from the remote end.
    ///
    /// Returns [`None`] once the transport is closed and drained.
    async fn receive(&self) -> Option<Message>;

    /// Pushes a message back so that the next [`Transport::receive`] returns it.
    ///
    /// Only one message may be pushed back at a time.
    fn unreceive(&self, message: Message) -> Result<()>;

    /// Closes the transport.
    async fn close(&self) -> Result<()>;

    /// Checks if the transport is still open for sending.
    fn is_open(&self) -> bool;
}
