use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;

use crate::{
    core::{
        roles::Role,
        types::Integer,
    },
    message::{
        common::error_for_request,
        message::Message,
    },
    session::session::Session,
};

/// The outcome of dispatching one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// The message was handled.
    Handled,
    /// The message could not be handled now and should be redelivered later.
    Busy,
    /// The message was dropped without effect.
    Ignored,
    /// The message was not legal for the session.
    Failed,
}

/// A per-subsystem router for inbound messages.
#[async_trait]
pub trait MessageFlow: Send + Sync {
    /// Name of the flow, mostly for logging.
    fn name(&self) -> &'static str;

    /// The inbound message types handled by the flow, per local role.
    ///
    /// Each list must be sorted.
    fn handled_messages(&self) -> &'static [(Role, &'static [Integer])];

    /// Checks if the flow handles the message for the session's roles.
    fn can_handle(&self, session: &Session, message: &Message) -> bool {
        let tag = message.tag();
        self.handled_messages().iter().any(|(role, tags)| {
            session.has_local_role(*role) && tags.binary_search(&tag).is_ok()
        })
    }

    /// Handles the message.
    async fn handle(&self, session: &Arc<Session>, message: &Message) -> Result<DispatchStatus>;
}

/// Answers a request on behalf of a router actor: a failed request is answered with ERROR.
pub(crate) async fn answer_request(
    session: &Arc<Session>,
    message: &Message,
    result: Result<()>,
) -> Result<DispatchStatus> {
    if let Err(err) = result {
        debug!(
            "Session {} failed {} request: {err:#}",
            session.name(),
            message.message_name()
        );
        session.send(error_for_request(message, &err)).await?;
    }
    Ok(DispatchStatus::Handled)
}
