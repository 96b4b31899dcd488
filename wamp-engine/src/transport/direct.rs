use std::sync::atomic::{
    AtomicBool,
    Ordering,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use futures_util::lock::Mutex;
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded_channel,
};

use crate::{
    message::message::Message,
    transport::transport::Transport,
};

/// An in-memory [`Transport`], connected directly to another in the same process.
///
/// Created in pairs by [`direct_transport_pair`]. Messages sent on one end are received on the
/// other in order.
#[derive(Debug)]
pub struct DirectTransport {
    name: String,
    message_tx: std::sync::Mutex<Option<UnboundedSender<Message>>>,
    message_rx: Mutex<UnboundedReceiver<Message>>,
    pushed_back: std::sync::Mutex<Option<Message>>,
    open: AtomicBool,
}

impl DirectTransport {
    fn new(
        name: String,
        message_tx: UnboundedSender<Message>,
        message_rx: UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            name,
            message_tx: std::sync::Mutex::new(Some(message_tx)),
            message_rx: Mutex::new(message_rx),
            pushed_back: std::sync::Mutex::new(None),
            open: AtomicBool::new(true),
        }
    }

    /// The name of this end of the transport, mostly for logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn sender(&self) -> Result<UnboundedSender<Message>> {
        self.message_tx
            .lock()
            .map_err(|_| Error::msg("transport sender lock poisoned"))?
            .clone()
            .ok_or_else(|| Error::msg(format!("transport {} is closed", self.name)))
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn send(&self, message: Message) -> Result<()> {
        self.sender()?
            .send(message)
            .map_err(|_| Error::msg(format!("transport {} peer is gone", self.name)))
    }

    async fn receive(&self) -> Option<Message> {
        if let Ok(mut pushed_back) = self.pushed_back.lock() {
            if let Some(message) = pushed_back.take() {
                return Some(message);
            }
        }
        self.message_rx.lock().await.recv().await
    }

    fn unreceive(&self, message: Message) -> Result<()> {
        let mut pushed_back = self
            .pushed_back
            .lock()
            .map_err(|_| Error::msg("transport pushback lock poisoned"))?;
        if pushed_back.is_some() {
            return Err(Error::msg(format!(
                "transport {} already holds a pushed back message",
                self.name
            )));
        }
        *pushed_back = Some(message);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        // Dropping the sender lets the other end drain what was sent, then observe the close.
        if let Ok(mut message_tx) = self.message_tx.lock() {
            message_tx.take();
        }
        self.message_rx.lock().await.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
            && self
                .message_tx
                .lock()
                .is_ok_and(|message_tx| message_tx.as_ref().is_some_and(|tx| !tx.is_closed()))
    }
}

/// Creates two connected [`DirectTransport`]s.
pub fn direct_transport_pair(name: &str) -> (DirectTransport, DirectTransport) {
    let (a_tx, b_rx) = unbounded_channel();
    let (b_tx, a_rx) = unbounded_channel();
    (
        DirectTransport::new(format!("{name}-a"), a_tx, a_rx),
        DirectTransport::new(format!("{name}-b"), b_tx, b_rx),
    )
}
