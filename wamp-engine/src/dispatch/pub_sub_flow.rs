use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::warn;

use crate::{
    core::{
        roles::Role,
        types::Integer,
    },
    dispatch::flow::{
        DispatchStatus,
        MessageFlow,
        answer_request,
    },
    message::message::Message,
    session::session::Session,
};

/// Routes publish/subscribe traffic to the broker, publisher, and subscriber of the session's
/// realm.
#[derive(Debug, Default)]
pub struct PubSubFlow {}

impl PubSubFlow {
    async fn handle_broker_request(
        &self,
        session: &Arc<Session>,
        message: &Message,
    ) -> Result<DispatchStatus> {
        let broker = match session.realm().await {
            Some(realm) => realm.broker().await,
            None => None,
        };
        let broker = match broker {
            Some(broker) => broker,
            None => {
                warn!(
                    "Session {} received {} message with no broker in its realm",
                    session.name(),
                    message.message_name()
                );
                return Ok(DispatchStatus::Failed);
            }
        };
        let result = match message {
            Message::Subscribe(subscribe) => broker.handle_subscribe(session, subscribe).await,
            Message::Unsubscribe(unsubscribe) => {
                broker.handle_unsubscribe(session, unsubscribe).await
            }
            Message::Publish(publish) => broker.handle_publish(session, publish).await,
            _ => return Ok(DispatchStatus::Ignored),
        };
        answer_request(session, message, result).await
    }

    async fn handle_publisher_response(
        &self,
        session: &Arc<Session>,
        message: &Message,
    ) -> Result<DispatchStatus> {
        let publisher = match session.realm().await {
            Some(realm) => realm.publisher().await,
            None => None,
        };
        let publisher = match publisher {
            Some(publisher) => publisher,
            None => return Ok(DispatchStatus::Failed),
        };
        match message {
            Message::Published(published) => {
                if !session
                    .take_pending(published.publish_request, Message::PUBLISH_TAG)
                    .await
                {
                    return Ok(DispatchStatus::Failed);
                }
                publisher.handle_published(session, published).await?;
            }
            Message::Error(error) => {
                if !session
                    .take_pending(error.request, Message::PUBLISH_TAG)
                    .await
                {
                    return Ok(DispatchStatus::Ignored);
                }
                publisher.handle_error(session, error).await?;
            }
            _ => return Ok(DispatchStatus::Ignored),
        }
        Ok(DispatchStatus::Handled)
    }

    async fn handle_subscriber_response(
        &self,
        session: &Arc<Session>,
        message: &Message,
    ) -> Result<DispatchStatus> {
        let subscriber = match session.realm().await {
            Some(realm) => realm.subscriber().await,
            None => None,
        };
        let subscriber = match subscriber {
            Some(subscriber) => subscriber,
            None => return Ok(DispatchStatus::Failed),
        };
        match message {
            Message::Subscribed(subscribed) => {
                if !session
                    .take_pending(subscribed.subscribe_request, Message::SUBSCRIBE_TAG)
                    .await
                {
                    return Ok(DispatchStatus::Failed);
                }
                subscriber.handle_subscribed(session, subscribed).await?;
            }
            Message::Unsubscribed(unsubscribed) => {
                if !session
                    .take_pending(unsubscribed.unsubscribe_request, Message::UNSUBSCRIBE_TAG)
                    .await
                {
                    return Ok(DispatchStatus::Failed);
                }
                subscriber.handle_unsubscribed(session, unsubscribed).await?;
            }
            Message::Event(event) => subscriber.handle_event(session, event).await?,
            Message::Error(error) => {
                if !session.take_pending(error.request, error.request_type).await {
                    return Ok(DispatchStatus::Ignored);
                }
                subscriber.handle_error(session, error).await?;
            }
            _ => return Ok(DispatchStatus::Ignored),
        }
        Ok(DispatchStatus::Handled)
    }
}

#[async_trait]
impl MessageFlow for PubSubFlow {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    fn handled_messages(&self) -> &'static [(Role, &'static [Integer])] {
        &[
            (
                Role::Broker,
                &[
                    Message::PUBLISH_TAG,
                    Message::SUBSCRIBE_TAG,
                    Message::UNSUBSCRIBE_TAG,
                ],
            ),
            (
                Role::Publisher,
                &[Message::ERROR_TAG, Message::PUBLISHED_TAG],
            ),
            (
                Role::Subscriber,
                &[
                    Message::ERROR_TAG,
                    Message::SUBSCRIBED_TAG,
                    Message::UNSUBSCRIBED_TAG,
                    Message::EVENT_TAG,
                ],
            ),
        ]
    }

    async fn handle(&self, session: &Arc<Session>, message: &Message) -> Result<DispatchStatus> {
        match message {
            Message::Subscribe(_) | Message::Unsubscribe(_) | Message::Publish(_) => {
                self.handle_broker_request(session, message).await
            }
            Message::Published(_) => self.handle_publisher_response(session, message).await,
            Message::Subscribed(_) | Message::Unsubscribed(_) | Message::Event(_) => {
                self.handle_subscriber_response(session, message).await
            }
            Message::Error(error) => match error.request_type {
                Message::PUBLISH_TAG if session.has_local_role(Role::Publisher) => {
                    self.handle_publisher_response(session, message).await
                }
                Message::SUBSCRIBE_TAG | Message::UNSUBSCRIBE_TAG
                    if session.has_local_role(Role::Subscriber) =>
                {
                    self.handle_subscriber_response(session, message).await
                }
                _ => Ok(DispatchStatus::Ignored),
            },
            _ => Ok(DispatchStatus::Ignored),
        }
    }
}
