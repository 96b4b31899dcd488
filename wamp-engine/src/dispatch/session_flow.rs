use std::sync::Arc;

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use log::{
    info,
    warn,
};

use crate::{
    core::{
        close::CloseReason,
        error::{
            BasicError,
            ChannelTransmittableError,
            InteractionError,
        },
        roles::Role,
        types::{
            Integer,
            Value,
        },
    },
    dispatch::flow::{
        DispatchStatus,
        MessageFlow,
    },
    message::{
        common::goodbye_and_out,
        message::{
            AbortMessage,
            GoodbyeMessage,
            HelloMessage,
            Message,
            WelcomeMessage,
        },
    },
    session::{
        party::Party,
        session::{
            Session,
            SessionState,
        },
    },
};

/// Checks if an inbound message may arrive in the session's current state.
///
/// Returns the protocol violation to abort the session with. A violation on a session that is
/// already closing or closed is raised as an error instead, since there is nothing to abort.
pub fn check_abort_condition(session: &Session, message: &Message) -> Result<Option<Error>> {
    let state = session.state();
    let violation = match message {
        Message::Hello(_)
        | Message::Welcome(_)
        | Message::Challenge(_)
        | Message::Authenticate(_)
            if state != SessionState::Open =>
        {
            Some(format!(
                "received {} message after session establishment",
                message.message_name()
            ))
        }
        message if !message.is_session_message() && state == SessionState::Open => Some(format!(
            "received {} message before session establishment",
            message.message_name()
        )),
        _ => None,
    };
    match violation {
        None => Ok(None),
        Some(violation) => match state {
            SessionState::Open | SessionState::Established => {
                Ok(Some(InteractionError::ProtocolViolation(violation).into()))
            }
            SessionState::Closing | SessionState::Closed => Err(BasicError::NotAllowed(format!(
                "session {} is {state:?}: {violation}",
                session.name()
            ))
            .into()),
        },
    }
}

/// Establishes and tears down sessions.
#[derive(Debug, Default)]
pub struct SessionFlow {}

impl SessionFlow {
    async fn handle_hello(&self, session: &Arc<Session>, message: &HelloMessage) -> Result<()> {
        if let Err(err) = self.establish_from_hello(session, message).await {
            session.abort(&err).await?;
        }
        Ok(())
    }

    async fn establish_from_hello(
        &self,
        session: &Arc<Session>,
        message: &HelloMessage,
    ) -> Result<()> {
        let realm = session
            .realms()
            .get(&message.realm)
            .await
            .ok_or(InteractionError::NoSuchRealm)?;
        let remote = Party::from_details(&message.details)?;
        let mut local = session.local_party_for(&realm).await;
        for role in remote.roles.keys() {
            let compatible = role
                .serving_router_role()
                .is_some_and(|serving| local.has_role(serving));
            if !compatible {
                return Err(InteractionError::NoSuchRole.into());
            }
        }

        // Echo the peer's identity back, so that both sides agree on it.
        local.identity = remote.identity.clone();
        let details = local.to_details();
        let id = session.realms().generate_session_id();
        info!(
            "Session {} establishing with id {id} in realm {} for agent {}",
            session.name(),
            realm.uri(),
            remote.agent
        );
        session.establish(id, realm, local, remote).await?;
        session
            .send(Message::Welcome(WelcomeMessage {
                session: id,
                details,
            }))
            .await
    }

    async fn handle_welcome(&self, session: &Arc<Session>, message: &WelcomeMessage) -> Result<()> {
        if let Err(err) = self.establish_from_welcome(session, message).await {
            session.abort(&err).await?;
        }
        Ok(())
    }

    async fn establish_from_welcome(
        &self,
        session: &Arc<Session>,
        message: &WelcomeMessage,
    ) -> Result<()> {
        let realm = session.realm().await.ok_or_else(|| {
            InteractionError::ProtocolViolation("received WELCOME without sending HELLO".to_owned())
        })?;
        let remote = Party::from_details(&message.details)?;
        let mut local = session.local_party().await;
        if let Some(Value::String(identity)) = message.details.get("authid") {
            local.identity = Some(identity.clone());
        }
        session.establish(message.session, realm, local, remote).await
    }

    async fn handle_abort(&self, session: &Arc<Session>, message: &AbortMessage) -> Result<()> {
        warn!(
            "Session {} aborted by peer: {}",
            session.name(),
            message.reason
        );
        session
            .set_close_error(ChannelTransmittableError {
                reason: message.reason.clone(),
                message: message
                    .details
                    .get("message")
                    .and_then(|message| message.string())
                    .unwrap_or("session aborted by peer")
                    .to_owned(),
                request_id: None,
            })
            .await;
        session.close_now().await
    }

    async fn handle_goodbye(&self, session: &Arc<Session>, message: &GoodbyeMessage) -> Result<()> {
        match session.state() {
            SessionState::Closing => session.close_now().await,
            SessionState::Established => {
                info!(
                    "Session {} received GOODBYE from peer: {}",
                    session.name(),
                    message.reason
                );
                if CloseReason::try_from(&message.reason)
                    .is_ok_and(|reason| reason != CloseReason::Normal)
                {
                    session
                        .set_close_error(ChannelTransmittableError {
                            reason: message.reason.clone(),
                            message: "session closed by peer".to_owned(),
                            request_id: None,
                        })
                        .await;
                }
                session.send(goodbye_and_out()).await?;
                session.close_now().await
            }
            _ => session
                .abort(
                    &InteractionError::ProtocolViolation(
                        "received GOODBYE message before session establishment".to_owned(),
                    )
                    .into(),
                )
                .await,
        }
    }
}

#[async_trait]
impl MessageFlow for SessionFlow {
    fn name(&self) -> &'static str {
        "session"
    }

    fn handled_messages(&self) -> &'static [(Role, &'static [Integer])] {
        const ROUTER: &[Integer] = &[
            Message::HELLO_TAG,
            Message::ABORT_TAG,
            Message::AUTHENTICATE_TAG,
            Message::GOODBYE_TAG,
        ];
        const CLIENT: &[Integer] = &[
            Message::WELCOME_TAG,
            Message::ABORT_TAG,
            Message::CHALLENGE_TAG,
            Message::GOODBYE_TAG,
        ];
        &[
            (Role::Broker, ROUTER),
            (Role::Dealer, ROUTER),
            (Role::Publisher, CLIENT),
            (Role::Subscriber, CLIENT),
            (Role::Caller, CLIENT),
            (Role::Callee, CLIENT),
        ]
    }

    async fn handle(&self, session: &Arc<Session>, message: &Message) -> Result<DispatchStatus> {
        match message {
            Message::Hello(message) => self.handle_hello(session, message).await?,
            Message::Welcome(message) => self.handle_welcome(session, message).await?,
            Message::Abort(message) => self.handle_abort(session, message).await?,
            Message::Goodbye(message) => self.handle_goodbye(session, message).await?,
            Message::Challenge(_) | Message::Authenticate(_) => {
                session
                    .abort(
                        &InteractionError::ProtocolViolation(format!(
                            "{} is not supported",
                            message.message_name()
                        ))
                        .into(),
                    )
                    .await?
            }
            _ => return Ok(DispatchStatus::Ignored),
        }
        Ok(DispatchStatus::Handled)
    }
}
