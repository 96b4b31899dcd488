use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::warn;

use crate::{
    core::{
        roles::Role,
        types::{
            Integer,
            flag,
        },
    },
    dispatch::flow::{
        DispatchStatus,
        MessageFlow,
        answer_request,
    },
    message::message::Message,
    session::session::Session,
};

/// Routes RPC traffic to the dealer, caller, and callee of the session's realm.
#[derive(Debug, Default)]
pub struct RpcFlow {}

impl RpcFlow {
    async fn handle_dealer_message(
        &self,
        session: &Arc<Session>,
        message: &Message,
    ) -> Result<DispatchStatus> {
        let dealer = match session.realm().await {
            Some(realm) => realm.dealer().await,
            None => None,
        };
        let dealer = match dealer {
            Some(dealer) => dealer,
            None => {
                warn!(
                    "Session {} received {} message with no dealer in its realm",
                    session.name(),
                    message.message_name()
                );
                return Ok(DispatchStatus::Failed);
            }
        };
        let result = match message {
            Message::Register(register) => dealer.handle_register(session, register).await,
            Message::Unregister(unregister) => dealer.handle_unregister(session, unregister).await,
            Message::Call(call) => dealer.handle_call(session, call).await,
            Message::Cancel(cancel) => dealer.handle_cancel(session, cancel).await,
            Message::Yield(yield_message) => dealer.handle_yield(session, yield_message).await,
            Message::Error(error) => {
                // Errors from callees answer invocations, which are tracked by the dealer. There is
                // no one to answer if the dealer rejects them.
                if let Err(err) = dealer.handle_error(session, error).await {
                    warn!(
                        "Session {} sent ERROR for unknown invocation {}: {err:#}",
                        session.name(),
                        error.request
                    );
                    return Ok(DispatchStatus::Ignored);
                }
                return Ok(DispatchStatus::Handled);
            }
            _ => return Ok(DispatchStatus::Ignored),
        };
        match (message, result) {
            // YIELD for an unknown invocation cannot be answered with an ERROR.
            (Message::Yield(yield_message), Err(err)) => {
                warn!(
                    "Session {} sent YIELD for unknown invocation {}: {err:#}",
                    session.name(),
                    yield_message.invocation_request
                );
                Ok(DispatchStatus::Ignored)
            }
            (message, result) => answer_request(session, message, result).await,
        }
    }

    async fn handle_caller_response(
        &self,
        session: &Arc<Session>,
        message: &Message,
    ) -> Result<DispatchStatus> {
        let caller = match session.realm().await {
            Some(realm) => realm.caller().await,
            None => None,
        };
        let caller = match caller {
            Some(caller) => caller,
            None => return Ok(DispatchStatus::Failed),
        };
        match message {
            Message::Result(result) => {
                // Progressive results keep the call pending until the final result.
                let correlated = if flag(&result.details, "progress") {
                    session
                        .matches_pending(result.call_request, Message::CALL_TAG)
                        .await
                } else {
                    session
                        .take_pending(result.call_request, Message::CALL_TAG)
                        .await
                };
                if !correlated {
                    return Ok(DispatchStatus::Failed);
                }
                caller.handle_result(session, result).await?;
            }
            Message::Error(error) => {
                if !session.take_pending(error.request, Message::CALL_TAG).await {
                    return Ok(DispatchStatus::Ignored);
                }
                caller.handle_error(session, error).await?;
            }
            _ => return Ok(DispatchStatus::Ignored),
        }
        Ok(DispatchStatus::Handled)
    }

    async fn handle_callee_message(
        &self,
        session: &Arc<Session>,
        message: &Message,
    ) -> Result<DispatchStatus> {
        let callee = match session.realm().await {
            Some(realm) => realm.callee().await,
            None => None,
        };
        let callee = match callee {
            Some(callee) => callee,
            None => return Ok(DispatchStatus::Failed),
        };
        match message {
            Message::Registered(registered) => {
                if !session
                    .take_pending(registered.register_request, Message::REGISTER_TAG)
                    .await
                {
                    return Ok(DispatchStatus::Failed);
                }
                callee.handle_registered(session, registered).await?;
            }
            Message::Unregistered(unregistered) => {
                if !session
                    .take_pending(unregistered.unregister_request, Message::UNREGISTER_TAG)
                    .await
                {
                    return Ok(DispatchStatus::Failed);
                }
                callee.handle_unregistered(session, unregistered).await?;
            }
            Message::Invocation(invocation) => {
                return callee.handle_invocation(session, invocation).await;
            }
            Message::Interrupt(interrupt) => callee.handle_interrupt(session, interrupt).await?,
            Message::Error(error) => {
                if !session.take_pending(error.request, error.request_type).await {
                    return Ok(DispatchStatus::Ignored);
                }
                callee.handle_error(session, error).await?;
            }
            _ => return Ok(DispatchStatus::Ignored),
        }
        Ok(DispatchStatus::Handled)
    }
}

#[async_trait]
impl MessageFlow for RpcFlow {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn handled_messages(&self) -> &'static [(Role, &'static [Integer])] {
        &[
            (
                Role::Dealer,
                &[
                    Message::ERROR_TAG,
                    Message::CALL_TAG,
                    Message::CANCEL_TAG,
                    Message::REGISTER_TAG,
                    Message::UNREGISTER_TAG,
                    Message::YIELD_TAG,
                ],
            ),
            (Role::Caller, &[Message::ERROR_TAG, Message::RESULT_TAG]),
            (
                Role::Callee,
                &[
                    Message::ERROR_TAG,
                    Message::REGISTERED_TAG,
                    Message::UNREGISTERED_TAG,
                    Message::INVOCATION_TAG,
                    Message::INTERRUPT_TAG,
                ],
            ),
        ]
    }

    async fn handle(&self, session: &Arc<Session>, message: &Message) -> Result<DispatchStatus> {
        match message {
            Message::Register(_)
            | Message::Unregister(_)
            | Message::Call(_)
            | Message::Cancel(_)
            | Message::Yield(_) => self.handle_dealer_message(session, message).await,
            Message::Result(_) => self.handle_caller_response(session, message).await,
            Message::Registered(_)
            | Message::Unregistered(_)
            | Message::Invocation(_)
            | Message::Interrupt(_) => self.handle_callee_message(session, message).await,
            Message::Error(error) => match error.request_type {
                Message::INVOCATION_TAG if session.has_local_role(Role::Dealer) => {
                    self.handle_dealer_message(session, message).await
                }
                Message::CALL_TAG if session.has_local_role(Role::Caller) => {
                    self.handle_caller_response(session, message).await
                }
                Message::REGISTER_TAG | Message::UNREGISTER_TAG
                    if session.has_local_role(Role::Callee) =>
                {
                    self.handle_callee_message(session, message).await
                }
                _ => Ok(DispatchStatus::Ignored),
            },
            _ => Ok(DispatchStatus::Ignored),
        }
    }
}
