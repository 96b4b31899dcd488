use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    core::{
        features::FeatureSet,
        roles::Role,
        uri::Uri,
    },
    dispatch::flow::DispatchStatus,
    message::message::{
        CallMessage,
        CancelMessage,
        ErrorMessage,
        EventMessage,
        InterruptMessage,
        InvocationMessage,
        PublishMessage,
        PublishedMessage,
        RegisterMessage,
        RegisteredMessage,
        ResultMessage,
        SubscribeMessage,
        SubscribedMessage,
        UnregisterMessage,
        UnregisteredMessage,
        UnsubscribeMessage,
        UnsubscribedMessage,
        YieldMessage,
    },
    session::session::Session,
};

/// Common behavior of every actor installed into a realm.
#[async_trait]
pub trait Actor: Send + Sync {
    /// Features the actor implements, before negotiation.
    fn supported_features(&self) -> FeatureSet;

    /// Called once when the actor is registered in a realm.
    async fn init(&self, realm: &Uri) -> Result<()> {
        let _ = realm;
        Ok(())
    }

    /// Called when a session in the realm closes, to purge state scoped to it.
    async fn done(&self, session: &Arc<Session>) {
        let _ = session;
    }
}

/// The router actor for pub/sub.
#[async_trait]
pub trait Broker: Actor {
    async fn handle_subscribe(&self, session: &Arc<Session>, message: &SubscribeMessage)
    -> Result<()>;
    async fn handle_unsubscribe(
        &self,
        session: &Arc<Session>,
        message: &UnsubscribeMessage,
    ) -> Result<()>;
    async fn handle_publish(&self, session: &Arc<Session>, message: &PublishMessage) -> Result<()>;
}

/// The router actor for RPC.
#[async_trait]
pub trait Dealer: Actor {
    async fn handle_register(&self, session: &Arc<Session>, message: &RegisterMessage)
    -> Result<()>;
    async fn handle_unregister(
        &self,
        session: &Arc<Session>,
        message: &UnregisterMessage,
    ) -> Result<()>;
    async fn handle_call(&self, session: &Arc<Session>, message: &CallMessage) -> Result<()>;
    async fn handle_cancel(&self, session: &Arc<Session>, message: &CancelMessage) -> Result<()>;
    async fn handle_yield(&self, session: &Arc<Session>, message: &YieldMessage) -> Result<()>;
    /// Handles an ERROR sent by a callee in response to an INVOCATION.
    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()>;
}

/// The client actor that publishes events.
#[async_trait]
pub trait Publisher: Actor {
    async fn handle_published(
        &self,
        session: &Arc<Session>,
        message: &PublishedMessage,
    ) -> Result<()>;
    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()>;
}

/// The client actor that receives events.
#[async_trait]
pub trait Subscriber: Actor {
    async fn handle_subscribed(
        &self,
        session: &Arc<Session>,
        message: &SubscribedMessage,
    ) -> Result<()>;
    async fn handle_unsubscribed(
        &self,
        session: &Arc<Session>,
        message: &UnsubscribedMessage,
    ) -> Result<()>;
    async fn handle_event(&self, session: &Arc<Session>, message: &EventMessage) -> Result<()>;
    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()>;
}

/// The client actor that calls procedures.
#[async_trait]
pub trait Caller: Actor {
    async fn handle_result(&self, session: &Arc<Session>, message: &ResultMessage) -> Result<()>;
    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()>;
}

/// The client actor that runs procedures.
#[async_trait]
pub trait Callee: Actor {
    async fn handle_registered(
        &self,
        session: &Arc<Session>,
        message: &RegisteredMessage,
    ) -> Result<()>;
    async fn handle_unregistered(
        &self,
        session: &Arc<Session>,
        message: &UnregisteredMessage,
    ) -> Result<()>;
    /// Admits an invocation.
    ///
    /// Returns [`DispatchStatus::Busy`] when the invocation cannot be admitted and should be
    /// redelivered later.
    async fn handle_invocation(
        &self,
        session: &Arc<Session>,
        message: &InvocationMessage,
    ) -> Result<DispatchStatus>;
    async fn handle_interrupt(
        &self,
        session: &Arc<Session>,
        message: &InterruptMessage,
    ) -> Result<()>;
    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()>;
}

/// An actor installed into a realm, tagged by the role it plays.
#[derive(Clone)]
pub enum RealmActor {
    Broker(Arc<dyn Broker>),
    Dealer(Arc<dyn Dealer>),
    Publisher(Arc<dyn Publisher>),
    Subscriber(Arc<dyn Subscriber>),
    Caller(Arc<dyn Caller>),
    Callee(Arc<dyn Callee>),
}

impl RealmActor {
    /// The role the actor plays.
    pub fn role(&self) -> Role {
        match self {
            Self::Broker(_) => Role::Broker,
            Self::Dealer(_) => Role::Dealer,
            Self::Publisher(_) => Role::Publisher,
            Self::Subscriber(_) => Role::Subscriber,
            Self::Caller(_) => Role::Caller,
            Self::Callee(_) => Role::Callee,
        }
    }

    pub fn supported_features(&self) -> FeatureSet {
        match self {
            Self::Broker(actor) => actor.supported_features(),
            Self::Dealer(actor) => actor.supported_features(),
            Self::Publisher(actor) => actor.supported_features(),
            Self::Subscriber(actor) => actor.supported_features(),
            Self::Caller(actor) => actor.supported_features(),
            Self::Callee(actor) => actor.supported_features(),
        }
    }

    pub async fn init(&self, realm: &Uri) -> Result<()> {
        match self {
            Self::Broker(actor) => actor.init(realm).await,
            Self::Dealer(actor) => actor.init(realm).await,
            Self::Publisher(actor) => actor.init(realm).await,
            Self::Subscriber(actor) => actor.init(realm).await,
            Self::Caller(actor) => actor.init(realm).await,
            Self::Callee(actor) => actor.init(realm).await,
        }
    }

    pub async fn done(&self, session: &Arc<Session>) {
        match self {
            Self::Broker(actor) => actor.done(session).await,
            Self::Dealer(actor) => actor.done(session).await,
            Self::Publisher(actor) => actor.done(session).await,
            Self::Subscriber(actor) => actor.done(session).await,
            Self::Caller(actor) => actor.done(session).await,
            Self::Callee(actor) => actor.done(session).await,
        }
    }
}

impl std::fmt::Debug for RealmActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RealmActor({})", self.role())
    }
}
