use std::sync::Arc;

use anyhow::Result;
use futures_util::lock::Mutex;
use log::info;
use thiserror::Error;

use crate::{
    core::{
        close::CloseReason,
        error::BasicError,
        features::FeatureSet,
        id::Id,
        options::ProcedureOptions,
        roles::{
            Role,
            expand_roles,
        },
        uri::Uri,
    },
    dispatch::dispatcher::Dispatcher,
    peer::{
        callee::{
            callee::{
                CalleeConfig,
                PeerCallee,
            },
            executor::{
                Executor,
                TokioExecutor,
            },
            invocation::ProcedureHandler,
        },
        caller::{
            PeerCaller,
            ProgressivePendingRpc,
            RpcCall,
            RpcResult,
            SimplePendingRpc,
        },
        publisher::{
            PeerPublisher,
            Publication,
        },
        subscriber::{
            EventListener,
            PeerSubscriber,
        },
    },
    realm::{
        actor::RealmActor,
        realm::{
            Realm,
            RealmConfig,
            RealmManager,
        },
    },
    session::{
        connection::{
            Connection,
            ConnectionConfig,
            ConnectionHandle,
        },
        session::{
            DEFAULT_AGENT,
            Session,
            SessionConfig,
            SessionState,
        },
    },
    stats::statistics::StatisticsRegistry,
    transport::transport::Transport,
};

/// Configuration for a [`Peer`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Name of the peer, mostly for logging.
    pub name: String,
    /// Agent name, communicated to the router.
    pub agent: String,
    /// Roles implemented by the peer.
    pub roles: Vec<Role>,
    /// Features the peer may advertise. All implemented features are advertised if unset.
    pub features: Option<FeatureSet>,
    /// Opaque identity token, sent to the router when joining a realm.
    pub identity: Option<String>,
    /// Additional configuration for the callee role.
    ///
    /// Ignored if the peer is not a callee.
    pub callee: CalleeConfig,
    /// Configuration for every connection.
    pub connection: ConnectionConfig,
}

impl PeerConfig {
    fn validate(&self) -> Result<()> {
        let roles = expand_roles(&self.roles);
        if roles.is_empty() {
            return Err(BasicError::InvalidArgument("peer requires at least one role".to_owned()).into());
        }
        if roles.iter().any(|role| role.is_router_role()) {
            return Err(
                BasicError::InvalidArgument("peer cannot take on router roles".to_owned()).into(),
            );
        }
        self.callee.validate()
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT.to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            roles: vec![Role::Client],
            features: None,
            identity: None,
            callee: CalleeConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

fn is_live(connection: &ConnectionHandle) -> bool {
    !connection.is_finished() && connection.session().state() != SessionState::Closed
}

/// Error for an operation that requires an active connection.
#[derive(Debug, Error)]
#[error("peer is not connected")]
pub struct PeerNotConnectedError;

/// A WAMP peer (a.k.a., client) that connects to a router and interacts with a realm.
///
/// A peer drives one session over one transport at a time. Once the session ends, the peer must
/// connect again before joining another realm.
pub struct Peer {
    config: PeerConfig,
    realms: Arc<RealmManager>,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<PeerPublisher>,
    subscriber: Arc<PeerSubscriber>,
    caller: Arc<PeerCaller>,
    callee: Arc<PeerCallee>,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl Peer {
    /// Creates a new peer, running procedures on the Tokio runtime.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: PeerConfig) -> Result<Self> {
        Self::with_executor(config, Arc::new(TokioExecutor::default()))
    }

    /// Creates a new peer, running procedures on the given executor.
    ///
    /// The executor is shut down when the peer is stopped.
    pub fn with_executor(config: PeerConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        let callee = Arc::new(PeerCallee::new(config.callee.clone(), executor)?);
        Ok(Self {
            config,
            realms: Arc::new(RealmManager::default()),
            dispatcher: Arc::new(Dispatcher::default()),
            publisher: Arc::new(PeerPublisher::default()),
            subscriber: Arc::new(PeerSubscriber::default()),
            caller: Arc::new(PeerCaller::default()),
            callee,
            connection: Mutex::new(None),
        })
    }

    /// Connects to a router over the transport.
    ///
    /// Fails if the peer is already connected.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.as_ref().is_some_and(is_live) {
            return Err(
                BasicError::NotAllowed(format!("peer {} is already connected", self.config.name))
                    .into(),
            );
        }
        let session = Arc::new(Session::new(
            SessionConfig {
                name: self.config.name.clone(),
                agent: self.config.agent.clone(),
                roles: self.config.roles.clone(),
                features: self.config.features.clone(),
                identity: self.config.identity.clone(),
            },
            transport.clone(),
            self.realms.clone(),
        ));
        *connection = Some(
            Connection::new(
                session,
                transport,
                self.dispatcher.clone(),
                self.config.connection.clone(),
            )
            .start(),
        );
        info!("Peer {} connected", self.config.name);
        Ok(())
    }

    async fn session(&self) -> Result<Arc<Session>> {
        self.connection
            .lock()
            .await
            .as_ref()
            .filter(|connection| is_live(connection))
            .map(|connection| connection.session().clone())
            .ok_or_else(|| PeerNotConnectedError.into())
    }

    async fn established_session(&self) -> Result<Arc<Session>> {
        let session = self.session().await?;
        if !session.is_established() {
            return Err(BasicError::NotAllowed(format!(
                "peer {} has not joined a realm",
                self.config.name
            ))
            .into());
        }
        Ok(session)
    }

    /// The current session ID, as given by the router.
    pub async fn current_session_id(&self) -> Option<Id> {
        self.session().await.ok().and_then(|session| session.id())
    }

    async fn local_realm(&self, uri: Uri) -> Result<Arc<Realm>> {
        let (realm, created) = self
            .realms
            .get_or_create(RealmConfig {
                name: uri.to_string(),
                uri,
            })
            .await;
        if created {
            for role in expand_roles(&self.config.roles) {
                let actor = match role {
                    Role::Publisher => RealmActor::Publisher(self.publisher.clone()),
                    Role::Subscriber => RealmActor::Subscriber(self.subscriber.clone()),
                    Role::Caller => RealmActor::Caller(self.caller.clone()),
                    Role::Callee => RealmActor::Callee(self.callee.clone()),
                    _ => continue,
                };
                realm.register_actor(actor).await?;
            }
        }
        Ok(realm)
    }

    /// Joins a realm, establishing a WAMP session.
    pub async fn join_realm(&self, realm: &str) -> Result<Id> {
        let session = self.session().await?;
        let realm = Uri::try_from(realm)?;
        self.local_realm(realm.clone()).await?;
        session.join(realm).await
    }

    /// Leaves the realm, closing the WAMP session.
    pub async fn leave_realm(&self) -> Result<()> {
        let session = self.established_session().await?;
        session.leave(CloseReason::Normal).await
    }

    /// Disconnects from the router, leaving the realm first if necessary.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = match self.connection.lock().await.take() {
            Some(connection) => connection,
            None => return Ok(()),
        };
        info!(
            "Peer {} was instructed to disconnect from the router",
            self.config.name
        );
        let session = connection.session().clone();
        match session.state() {
            SessionState::Established | SessionState::Closing => {
                session.leave(CloseReason::Normal).await?
            }
            _ => session.close_now().await?,
        }
        connection.join().await
    }

    /// Stops the peer for good, disconnecting and canceling every running invocation.
    pub async fn stop(&self) -> Result<()> {
        let result = self.disconnect().await;
        self.callee.stop().await;
        result
    }

    /// Subscribes to a topic in the realm.
    ///
    /// The listener receives every event published to the topic until the peer unsubscribes or the
    /// session ends.
    pub async fn subscribe(&self, topic: Uri, listener: Arc<dyn EventListener>) -> Result<Id> {
        let session = self.established_session().await?;
        self.subscriber.subscribe(&session, topic, listener).await
    }

    /// Unsubscribes from a topic in the realm.
    pub async fn unsubscribe(&self, subscription: Id) -> Result<()> {
        let session = self.established_session().await?;
        self.subscriber.unsubscribe(&session, subscription).await
    }

    /// Publishes an event to a topic in the realm.
    ///
    /// Returns the publication ID if acknowledgement was requested.
    pub async fn publish(&self, topic: Uri, publication: Publication) -> Result<Option<Id>> {
        let session = self.established_session().await?;
        self.publisher.publish(&session, topic, publication).await
    }

    /// Registers a procedure in the realm.
    pub async fn register<H>(
        &self,
        procedure: Uri,
        options: ProcedureOptions,
        handler: H,
    ) -> Result<Id>
    where
        H: ProcedureHandler + 'static,
    {
        let session = self.established_session().await?;
        self.callee
            .register(&session, procedure, options, Arc::new(handler))
            .await
    }

    /// Unregisters a procedure in the realm.
    pub async fn unregister(&self, registration: Id) -> Result<()> {
        let session = self.established_session().await?;
        self.callee.unregister(&session, registration).await
    }

    /// Calls a procedure, returning a handle to its pending result.
    pub async fn call(&self, procedure: Uri, rpc_call: RpcCall) -> Result<SimplePendingRpc> {
        let session = self.established_session().await?;
        self.caller.call(&session, procedure, rpc_call).await
    }

    /// Calls a procedure and waits for its result.
    pub async fn call_and_wait(&self, procedure: Uri, rpc_call: RpcCall) -> Result<RpcResult> {
        self.call(procedure, rpc_call).await?.result().await
    }

    /// Calls a procedure that may produce progressive results.
    pub async fn call_with_progress(
        &self,
        procedure: Uri,
        rpc_call: RpcCall,
    ) -> Result<ProgressivePendingRpc> {
        let session = self.established_session().await?;
        self.caller
            .call_with_progress(&session, procedure, rpc_call)
            .await
    }

    /// Statistics for every procedure run by the peer.
    pub fn statistics(&self) -> Arc<StatisticsRegistry> {
        self.callee.statistics().clone()
    }

    /// The peer's callee, for introspection into running invocations.
    pub fn callee(&self) -> &Arc<PeerCallee> {
        &self.callee
    }
}
