use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;
use log::debug;
use tokio::sync::oneshot;
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
        options::PublishOptions,
        types::{
            Dictionary,
            List,
        },
        uri::Uri,
    },
    message::message::{
        ErrorMessage,
        Message,
        PublishMessage,
        PublishedMessage,
    },
    peer::canceled_error,
    realm::actor::{
        Actor,
        Publisher,
    },
    session::session::Session,
};

/// An event to publish to a topic.
#[derive(Debug, Default, Clone)]
pub struct Publication {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: PublishOptions,
}

/// The peer's publisher, which publishes events and waits for acknowledgements.
#[derive(Default)]
pub struct PeerPublisher {
    pending: Mutex<HashMap<(Uuid, Id), oneshot::Sender<ChannelTransmittableResult<Id>>>>,
}

impl PeerPublisher {
    /// Publishes an event to a topic.
    ///
    /// Returns the publication ID if the publication was acknowledged by the broker.
    pub async fn publish(
        &self,
        session: &Arc<Session>,
        topic: Uri,
        publication: Publication,
    ) -> Result<Option<Id>> {
        let request = session.next_request_id();
        let acknowledge = publication.options.acknowledge;
        let message = Message::Publish(PublishMessage {
            request,
            options: publication.options.to_dictionary(),
            topic,
            arguments: publication.arguments,
            arguments_keyword: publication.arguments_keyword,
        });
        if !acknowledge {
            session.send(message).await?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert((session.uuid(), request), tx);
        if let Err(err) = session.send_request(message).await {
            self.pending.lock().await.remove(&(session.uuid(), request));
            return Err(err);
        }
        let publication = rx
            .await
            .map_err(|_| InteractionError::Canceled)?
            .map_err(|err| err.into_error())?;
        Ok(Some(publication))
    }
}

#[async_trait]
impl Actor for PeerPublisher {
    fn supported_features(&self) -> FeatureSet {
        FeatureSet::from_iter([
            Feature::PublisherExclusion,
            Feature::SubscriberBlackwhiteListing,
            Feature::PublisherIdentification,
        ])
    }

    async fn done(&self, session: &Arc<Session>) {
        let mut pending = self.pending.lock().await;
        let requests = pending
            .keys()
            .filter(|(uuid, _)| *uuid == session.uuid())
            .cloned()
            .collect::<Vec<_>>();
        for request in requests {
            if let Some(tx) = pending.remove(&request) {
                tx.send(Err(canceled_error())).ok();
            }
        }
    }
}

#[async_trait]
impl Publisher for PeerPublisher {
    async fn handle_published(
        &self,
        session: &Arc<Session>,
        message: &PublishedMessage,
    ) -> Result<()> {
        if let Some(tx) = self
            .pending
            .lock()
            .await
            .remove(&(session.uuid(), message.publish_request))
        {
            tx.send(Ok(message.publication)).ok();
        }
        debug!(
            "Session {} published {}",
            session.name(),
            message.publication
        );
        Ok(())
    }

    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()> {
        if let Some(tx) = self
            .pending
            .lock()
            .await
            .remove(&(session.uuid(), message.request))
        {
            let error = ChannelTransmittableError::try_from(&Message::Error(message.clone()))?;
            tx.send(Err(error)).ok();
        }
        Ok(())
    }
}
