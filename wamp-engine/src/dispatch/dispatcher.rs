use std::sync::Arc;

use anyhow::Result;
use log::{
    debug,
    warn,
};

use crate::{
    dispatch::{
        flow::{
            DispatchStatus,
            MessageFlow,
        },
        pub_sub_flow::PubSubFlow,
        rpc_flow::RpcFlow,
        session_flow::{
            SessionFlow,
            check_abort_condition,
        },
    },
    message::message::Message,
    session::session::Session,
};

/// Dispatches inbound messages for a session through its message flows.
pub struct Dispatcher {
    flows: Vec<Box<dyn MessageFlow>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            flows: vec![
                Box::new(SessionFlow::default()),
                Box::new(PubSubFlow::default()),
                Box::new(RpcFlow::default()),
            ],
        }
    }
}

impl Dispatcher {
    /// Dispatches a single inbound message.
    ///
    /// Protocol violations abort the session. A message that no flow handles for the session's
    /// roles fails. A message a flow ignores is offered to the next flow.
    pub async fn dispatch(&self, session: &Arc<Session>, message: &Message) -> Result<DispatchStatus> {
        debug!("Session {} received message: {message:?}", session.name());
        if let Some(violation) = check_abort_condition(session, message)? {
            session.abort(&violation).await?;
            return Ok(DispatchStatus::Failed);
        }

        let mut status = None;
        for flow in &self.flows {
            if !flow.can_handle(session, message) {
                continue;
            }
            match flow.handle(session, message).await.map_err(|err| {
                err.context(format!(
                    "{} flow failed to handle {} message",
                    flow.name(),
                    message.message_name()
                ))
            })? {
                DispatchStatus::Ignored => status = Some(DispatchStatus::Ignored),
                handled => return Ok(handled),
            }
        }

        match status {
            Some(status) => {
                debug!(
                    "Session {} ignored {} message",
                    session.name(),
                    message.message_name()
                );
                Ok(status)
            }
            None => {
                warn!(
                    "Session {} cannot handle {} message with roles {:?}",
                    session.name(),
                    message.message_name(),
                    session.local_roles()
                );
                Ok(DispatchStatus::Failed)
            }
        }
    }
}
