use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;
use log::{
    debug,
    warn,
};
use tokio::sync::{
    mpsc::UnboundedSender,
    oneshot,
};
use uuid::Uuid;

use crate::{
    core::{
        error::{
            ChannelTransmittableError,
            ChannelTransmittableResult,
            InteractionError,
        },
        features::{
            Feature,
            FeatureSet,
        },
        hash::HashMap,
        id::Id,
        types::{
            Dictionary,
            List,
        },
        uri::Uri,
    },
    message::message::{
        ErrorMessage,
        EventMessage,
        Message,
        SubscribeMessage,
        SubscribedMessage,
        UnsubscribeMessage,
        UnsubscribedMessage,
    },
    peer::canceled_error,
    realm::actor::{
        Actor,
        Subscriber,
    },
    session::session::Session,
};

/// An event received for a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub subscription: Id,
    pub publication: Id,
    pub details: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// Receives events for a subscription.
///
/// Listeners run on the session's message loop, so they should return quickly.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: ReceivedEvent);
}

#[async_trait]
impl EventListener for UnboundedSender<ReceivedEvent> {
    async fn on_event(&self, event: ReceivedEvent) {
        if self.send(event).is_err() {
            debug!("Dropped event because the listener channel is closed");
        }
    }
}

struct PendingSubscription {
    topic: Uri,
    listener: Arc<dyn EventListener>,
    tx: oneshot::Sender<ChannelTransmittableResult<Id>>,
}

struct ActiveSubscription {
    topic: Uri,
    listener: Arc<dyn EventListener>,
}

struct PendingUnsubscription {
    subscription: Id,
    tx: oneshot::Sender<ChannelTransmittableResult<()>>,
}

#[derive(Default)]
struct SubscriberState {
    pending_subscriptions: HashMap<(Uuid, Id), PendingSubscription>,
    pending_unsubscriptions: HashMap<(Uuid, Id), PendingUnsubscription>,
    subscriptions: HashMap<(Uuid, Id), ActiveSubscription>,
}

/// The peer's subscriber, which keeps the listener for each confirmed subscription.
#[derive(Default)]
pub struct PeerSubscriber {
    state: Mutex<SubscriberState>,
}

impl PeerSubscriber {
    /// Subscribes to a topic, returning the subscription ID once the broker confirms it.
    pub async fn subscribe(
        &self,
        session: &Arc<Session>,
        topic: Uri,
        listener: Arc<dyn EventListener>,
    ) -> Result<Id> {
        let request = session.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.state.lock().await.pending_subscriptions.insert(
            (session.uuid(), request),
            PendingSubscription {
                topic: topic.clone(),
                listener,
                tx,
            },
        );
        if let Err(err) = session
            .send_request(Message::Subscribe(SubscribeMessage {
                request,
                options: Dictionary::default(),
                topic,
            }))
            .await
        {
            self.state
                .lock()
                .await
                .pending_subscriptions
                .remove(&(session.uuid(), request));
            return Err(err);
        }
        rx.await
            .map_err(|_| InteractionError::Canceled)?
            .map_err(|err| err.into_error())
    }

    /// Unsubscribes from a topic. Events stop once the broker confirms.
    pub async fn unsubscribe(&self, session: &Arc<Session>, subscription: Id) -> Result<()> {
        let request = session.next_request_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if !state
                .subscriptions
                .contains_key(&(session.uuid(), subscription))
            {
                return Err(InteractionError::NoSuchSubscription.into());
            }
            state.pending_unsubscriptions.insert(
                (session.uuid(), request),
                PendingUnsubscription { subscription, tx },
            );
        }
        if let Err(err) = session
            .send_request(Message::Unsubscribe(UnsubscribeMessage {
                request,
                subscribed_subscription: subscription,
            }))
            .await
        {
            self.state
                .lock()
                .await
                .pending_unsubscriptions
                .remove(&(session.uuid(), request));
            return Err(err);
        }
        rx.await
            .map_err(|_| InteractionError::Canceled)?
            .map_err(|err| err.into_error())
    }

    /// The topics the session is subscribed to.
    pub async fn topics(&self, session: &Session) -> Vec<Uri> {
        self.state
            .lock()
            .await
            .subscriptions
            .iter()
            .filter(|((uuid, _), _)| *uuid == session.uuid())
            .map(|(_, subscription)| subscription.topic.clone())
            .collect()
    }
}

#[async_trait]
impl Actor for PeerSubscriber {
    fn supported_features(&self) -> FeatureSet {
        FeatureSet::from_iter([Feature::PublisherIdentification])
    }

    async fn done(&self, session: &Arc<Session>) {
        let mut state = self.state.lock().await;
        let uuid = session.uuid();
        state.subscriptions.retain(|(owner, _), _| *owner != uuid);
        let requests = state
            .pending_subscriptions
            .keys()
            .filter(|(owner, _)| *owner == uuid)
            .cloned()
            .collect::<Vec<_>>();
        for request in requests {
            if let Some(pending) = state.pending_subscriptions.remove(&request) {
                pending.tx.send(Err(canceled_error())).ok();
            }
        }
        let requests = state
            .pending_unsubscriptions
            .keys()
            .filter(|(owner, _)| *owner == uuid)
            .cloned()
            .collect::<Vec<_>>();
        for request in requests {
            if let Some(pending) = state.pending_unsubscriptions.remove(&request) {
                pending.tx.send(Err(canceled_error())).ok();
            }
        }
    }
}

#[async_trait]
impl Subscriber for PeerSubscriber {
    async fn handle_subscribed(
        &self,
        session: &Arc<Session>,
        message: &SubscribedMessage,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let pending = match state
            .pending_subscriptions
            .remove(&(session.uuid(), message.subscribe_request))
        {
            Some(pending) => pending,
            None => return Ok(()),
        };
        debug!(
            "Session {} subscribed to {} with subscription {}",
            session.name(),
            pending.topic,
            message.subscription
        );
        state.subscriptions.insert(
            (session.uuid(), message.subscription),
            ActiveSubscription {
                topic: pending.topic,
                listener: pending.listener,
            },
        );
        pending.tx.send(Ok(message.subscription)).ok();
        Ok(())
    }

    async fn handle_unsubscribed(
        &self,
        session: &Arc<Session>,
        message: &UnsubscribedMessage,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let pending = match state
            .pending_unsubscriptions
            .remove(&(session.uuid(), message.unsubscribe_request))
        {
            Some(pending) => pending,
            None => return Ok(()),
        };
        state
            .subscriptions
            .remove(&(session.uuid(), pending.subscription));
        pending.tx.send(Ok(())).ok();
        Ok(())
    }

    async fn handle_event(&self, session: &Arc<Session>, message: &EventMessage) -> Result<()> {
        let listener = self
            .state
            .lock()
            .await
            .subscriptions
            .get(&(session.uuid(), message.subscribed_subscription))
            .map(|subscription| subscription.listener.clone());
        let listener = match listener {
            Some(listener) => listener,
            None => {
                debug!(
                    "Session {} dropped event for unknown subscription {}",
                    session.name(),
                    message.subscribed_subscription
                );
                return Ok(());
            }
        };
        listener
            .on_event(ReceivedEvent {
                subscription: message.subscribed_subscription,
                publication: message.published_publication,
                details: message.details.clone(),
                arguments: message.publish_arguments.clone(),
                arguments_keyword: message.publish_arguments_keyword.clone(),
            })
            .await;
        Ok(())
    }

    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()> {
        let error = ChannelTransmittableError::try_from(&Message::Error(message.clone()))?;
        let mut state = self.state.lock().await;
        let key = (session.uuid(), message.request);
        match message.request_type {
            Message::SUBSCRIBE_TAG => {
                if let Some(pending) = state.pending_subscriptions.remove(&key) {
                    pending.tx.send(Err(error)).ok();
                }
            }
            Message::UNSUBSCRIBE_TAG => {
                if let Some(pending) = state.pending_unsubscriptions.remove(&key) {
                    pending.tx.send(Err(error)).ok();
                }
            }
            request_type => warn!(
                "Subscriber received ERROR for unexpected request type {request_type}"
            ),
        }
        Ok(())
    }
}
