use std::sync::{
    Arc,
    atomic::{
        AtomicUsize,
        Ordering,
    },
};

use anyhow::Result;
use futures_util::lock::Mutex;
use log::{
    info,
    warn,
};

use crate::{
    core::{
        close::CloseReason,
        features::FeatureSet,
        hash::HashMap,
        roles::{
            Role,
            expand_roles,
        },
        uri::Uri,
    },
    dispatch::dispatcher::Dispatcher,
    realm::{
        actor::RealmActor,
        realm::{
            Realm,
            RealmConfig,
            RealmManager,
        },
    },
    router::{
        broker::RouterBroker,
        dealer::RouterDealer,
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
    transport::transport::Transport,
};

/// Configuration for a [`Router`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Name of the router, used to name its sessions.
    pub name: String,
    /// Agent name, communicated to peers.
    pub agent: String,
    /// Roles implemented by the router.
    pub roles: Vec<Role>,
    /// Features the router may advertise. All implemented features are advertised if unset.
    pub features: Option<FeatureSet>,
    /// Realms available on the router.
    pub realms: Vec<RealmConfig>,
    /// Configuration for every accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "router".to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            roles: vec![Role::Router],
            features: None,
            realms: Vec::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

struct RealmActors {
    broker: Option<Arc<RouterBroker>>,
    dealer: Option<Arc<RouterDealer>>,
}

/// A WAMP router, which serves realms to peers connecting over transports.
///
/// Every accepted transport carries exactly one session.
pub struct Router {
    config: RouterConfig,
    realms: Arc<RealmManager>,
    actors: HashMap<Uri, RealmActors>,
    dispatcher: Arc<Dispatcher>,
    connections: Mutex<Vec<Arc<Session>>>,
    accepted: AtomicUsize,
}

impl Router {
    /// Creates a new router, creating every configured realm with the actors for the router's
    /// roles.
    pub async fn new(config: RouterConfig) -> Result<Self> {
        let realms = Arc::new(RealmManager::default());
        let roles = expand_roles(&config.roles);
        let mut actors = HashMap::default();
        for realm_config in &config.realms {
            let realm = realms.insert(Realm::new(realm_config.clone())).await?;
            let broker = if roles.contains(&Role::Broker) {
                let broker = Arc::new(RouterBroker::default());
                realm
                    .register_actor(RealmActor::Broker(broker.clone()))
                    .await?;
                Some(broker)
            } else {
                None
            };
            let dealer = if roles.contains(&Role::Dealer) {
                let dealer = Arc::new(RouterDealer::default());
                realm
                    .register_actor(RealmActor::Dealer(dealer.clone()))
                    .await?;
                Some(dealer)
            } else {
                None
            };
            info!(
                "Router {} serving realm {} ({})",
                config.name, realm_config.uri, realm_config.name
            );
            actors.insert(realm_config.uri.clone(), RealmActors { broker, dealer });
        }
        Ok(Self {
            config,
            realms,
            actors,
            dispatcher: Arc::new(Dispatcher::default()),
            connections: Mutex::new(Vec::default()),
            accepted: AtomicUsize::new(0),
        })
    }

    /// The realms served by the router.
    pub fn realms(&self) -> &Arc<RealmManager> {
        &self.realms
    }

    /// The broker serving a realm.
    pub fn broker(&self, realm: &Uri) -> Option<Arc<RouterBroker>> {
        self.actors.get(realm)?.broker.clone()
    }

    /// The dealer serving a realm.
    pub fn dealer(&self, realm: &Uri) -> Option<Arc<RouterDealer>> {
        self.actors.get(realm)?.dealer.clone()
    }

    /// Accepts a transport, starting a new session on it.
    pub async fn accept(&self, transport: Arc<dyn Transport>) -> ConnectionHandle {
        let index = self.accepted.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            SessionConfig {
                name: format!("{}-{index}", self.config.name),
                agent: self.config.agent.clone(),
                roles: self.config.roles.clone(),
                features: self.config.features.clone(),
                identity: None,
            },
            transport.clone(),
            self.realms.clone(),
        ));
        let mut connections = self.connections.lock().await;
        connections.retain(|session| session.state() != SessionState::Closed);
        connections.push(session.clone());
        Connection::new(
            session,
            transport,
            self.dispatcher.clone(),
            self.config.connection.clone(),
        )
        .start()
    }

    /// Shuts the router down, ending every session.
    ///
    /// Established sessions are sent GOODBYE; sessions that never joined a realm are closed.
    pub async fn shut_down(&self) -> Result<()> {
        info!("Router {} shutting down", self.config.name);
        let result = self.realms.shut_down(CloseReason::SystemShutdown).await;
        for session in self.connections.lock().await.drain(..) {
            if let Err(err) = session.close_now().await {
                warn!("Failed to close session {}: {err:#}", session.name());
            }
        }
        result
    }
}
