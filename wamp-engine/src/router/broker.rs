use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;
use log::{
    debug,
    warn,
};

use crate::{
    core::{
        error::InteractionError,
        features::{
            Feature,
            FeatureSet,
        },
        hash::HashMap,
        id::{
            Id,
            IdAllocator,
            SequentialIdAllocator,
        },
        options::PublishOptions,
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        EventMessage,
        Message,
        PublishMessage,
        PublishedMessage,
        SubscribeMessage,
        SubscribedMessage,
        UnsubscribeMessage,
        UnsubscribedMessage,
    },
    realm::actor::{
        Actor,
        Broker,
    },
    session::session::Session,
};

struct TopicSubscription {
    topic: Uri,
    session: Arc<Session>,
}

#[derive(Default)]
struct Subscriptions {
    by_id: HashMap<Id, TopicSubscription>,
    // In order of subscription.
    by_topic: HashMap<Uri, Vec<Id>>,
}

impl Subscriptions {
    fn remove(&mut self, id: Id) -> Option<TopicSubscription> {
        let subscription = self.by_id.remove(&id)?;
        if let Some(ids) = self.by_topic.get_mut(&subscription.topic) {
            ids.retain(|subscribed| *subscribed != id);
            if ids.is_empty() {
                self.by_topic.remove(&subscription.topic);
            }
        }
        Some(subscription)
    }
}

fn validate_topic(topic: &Uri) -> Result<()> {
    if topic.is_reserved() {
        return Err(InteractionError::InvalidUri.into());
    }
    Ok(())
}

/// The router's broker, which fans published events out to subscribers of exact topics.
#[derive(Default)]
pub struct RouterBroker {
    subscriptions: Mutex<Subscriptions>,
    subscription_ids: SequentialIdAllocator,
    publication_ids: SequentialIdAllocator,
}

impl RouterBroker {
    /// The number of subscriptions to a topic.
    pub async fn subscriber_count(&self, topic: &Uri) -> usize {
        self.subscriptions
            .lock()
            .await
            .by_topic
            .get(topic)
            .map(|ids| ids.len())
            .unwrap_or_default()
    }

    async fn subscribers(&self, topic: &Uri) -> Vec<(Id, Arc<Session>)> {
        let subscriptions = self.subscriptions.lock().await;
        subscriptions
            .by_topic
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                subscriptions
                    .by_id
                    .get(id)
                    .map(|subscription| (*id, subscription.session.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl Actor for RouterBroker {
    fn supported_features(&self) -> FeatureSet {
        FeatureSet::from_iter([
            Feature::PublisherExclusion,
            Feature::SubscriberBlackwhiteListing,
            Feature::PublisherIdentification,
        ])
    }

    async fn done(&self, session: &Arc<Session>) {
        let mut subscriptions = self.subscriptions.lock().await;
        let ids = subscriptions
            .by_id
            .iter()
            .filter(|(_, subscription)| subscription.session.uuid() == session.uuid())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in ids {
            subscriptions.remove(id);
        }
    }
}

#[async_trait]
impl Broker for RouterBroker {
    async fn handle_subscribe(
        &self,
        session: &Arc<Session>,
        message: &SubscribeMessage,
    ) -> Result<()> {
        validate_topic(&message.topic)?;
        let subscription = self.subscription_ids.generate_id();

        // SUBSCRIBED goes out under the lock, so no publication can reach the subscriber ahead of
        // it.
        let mut subscriptions = self.subscriptions.lock().await;
        session
            .send(Message::Subscribed(SubscribedMessage {
                subscribe_request: message.request,
                subscription,
            }))
            .await?;
        subscriptions.by_id.insert(
            subscription,
            TopicSubscription {
                topic: message.topic.clone(),
                session: session.clone(),
            },
        );
        subscriptions
            .by_topic
            .entry(message.topic.clone())
            .or_default()
            .push(subscription);
        drop(subscriptions);

        debug!(
            "Session {} subscribed to {} with subscription {subscription}",
            session.name(),
            message.topic
        );
        Ok(())
    }

    async fn handle_unsubscribe(
        &self,
        session: &Arc<Session>,
        message: &UnsubscribeMessage,
    ) -> Result<()> {
        {
            let mut subscriptions = self.subscriptions.lock().await;
            let owned = subscriptions
                .by_id
                .get(&message.subscribed_subscription)
                .is_some_and(|subscription| subscription.session.uuid() == session.uuid());
            if !owned {
                return Err(InteractionError::NoSuchSubscription.into());
            }
            subscriptions.remove(message.subscribed_subscription);
        }
        session
            .send(Message::Unsubscribed(UnsubscribedMessage {
                unsubscribe_request: message.request,
            }))
            .await
    }

    async fn handle_publish(&self, session: &Arc<Session>, message: &PublishMessage) -> Result<()> {
        validate_topic(&message.topic)?;
        let options = PublishOptions::try_from(&message.options)?;
        let publication = self.publication_ids.generate_id();
        let publisher = session.id();

        let mut details = Dictionary::default();
        if options.disclose_me {
            if let Some(publisher) = publisher {
                details.insert("publisher".to_owned(), Value::from(publisher));
            }
        }

        for (subscription, subscriber) in self.subscribers(&message.topic).await {
            if !subscriber.is_established() {
                continue;
            }
            let allowed = subscriber
                .id()
                .is_some_and(|subscriber| options.allows(publisher, subscriber));
            if !allowed {
                continue;
            }
            if let Err(err) = subscriber
                .send(Message::Event(EventMessage {
                    subscribed_subscription: subscription,
                    published_publication: publication,
                    details: details.clone(),
                    publish_arguments: message.arguments.clone(),
                    publish_arguments_keyword: message.arguments_keyword.clone(),
                }))
                .await
            {
                warn!(
                    "Failed to deliver publication {publication} to session {}: {err:#}",
                    subscriber.name()
                );
            }
        }

        if options.acknowledge {
            session
                .send(Message::Published(PublishedMessage {
                    publish_request: message.request,
                    publication,
                }))
                .await?;
        }
        Ok(())
    }
}
