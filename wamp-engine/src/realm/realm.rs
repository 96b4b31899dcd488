use std::{
    sync::{
        Arc,
        Weak,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::future::join_all;
use log::{
    debug,
    info,
    warn,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    core::{
        close::CloseReason,
        error::BasicError,
        features::FeatureSet,
        hash::HashMap,
        id::{
            Id,
            IdAllocator,
            RandomIdAllocator,
        },
        roles::Role,
        uri::Uri,
    },
    message::common::goodbye_with_close_reason,
    realm::actor::{
        Broker,
        Callee,
        Caller,
        Dealer,
        Publisher,
        RealmActor,
        Subscriber,
    },
    session::session::Session,
};

/// Configuration for a realm.
#[derive(Debug, Clone)]
pub struct RealmConfig {
    /// Name of the realm, mostly for logging.
    pub name: String,
    /// URI for peers to join the realm.
    pub uri: Uri,
}

/// A realm, which is a scoped area for sessions and the actors serving them.
///
/// Sessions cannot communicate across realms. Actors must be registered before the first session
/// joins, after which the realm is sealed.
pub struct Realm {
    config: RealmConfig,
    actors: RwLock<HashMap<Role, RealmActor>>,
    sealed: AtomicBool,
    sessions: RwLock<HashMap<Uuid, Weak<Session>>>,
}

impl Realm {
    /// Creates a new realm with no actors.
    pub fn new(config: RealmConfig) -> Self {
        Self {
            config,
            actors: RwLock::new(HashMap::default()),
            sealed: AtomicBool::new(false),
            sessions: RwLock::new(HashMap::default()),
        }
    }

    /// The URI for joining the realm.
    pub fn uri(&self) -> &Uri {
        &self.config.uri
    }

    /// The name of the realm.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Registers an actor for the role it plays.
    pub async fn register_actor(&self, actor: RealmActor) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(BasicError::NotAllowed(format!(
                "realm {} already has sessions",
                self.uri()
            ))
            .into());
        }
        let role = actor.role();
        let mut actors = self.actors.write().await;
        if actors.contains_key(&role) {
            return Err(BasicError::NotAllowed(format!(
                "realm {} already has a {role} actor",
                self.uri()
            ))
            .into());
        }
        actor.init(self.uri()).await?;
        debug!("Registered {role} actor in realm {}", self.uri());
        actors.insert(role, actor);
        Ok(())
    }

    /// Checks if an actor is registered for the role.
    pub async fn has_actor(&self, role: Role) -> bool {
        self.actors.read().await.contains_key(&role)
    }

    /// Features implemented by the actor for the role, if any.
    pub async fn supported_features(&self, role: Role) -> Option<FeatureSet> {
        self.actors
            .read()
            .await
            .get(&role)
            .map(|actor| actor.supported_features())
    }

    async fn actor(&self, role: Role) -> Option<RealmActor> {
        self.actors.read().await.get(&role).cloned()
    }

    pub async fn broker(&self) -> Option<Arc<dyn Broker>> {
        match self.actor(Role::Broker).await {
            Some(RealmActor::Broker(actor)) => Some(actor),
            _ => None,
        }
    }

    pub async fn dealer(&self) -> Option<Arc<dyn Dealer>> {
        match self.actor(Role::Dealer).await {
            Some(RealmActor::Dealer(actor)) => Some(actor),
            _ => None,
        }
    }

    pub async fn publisher(&self) -> Option<Arc<dyn Publisher>> {
        match self.actor(Role::Publisher).await {
            Some(RealmActor::Publisher(actor)) => Some(actor),
            _ => None,
        }
    }

    pub async fn subscriber(&self) -> Option<Arc<dyn Subscriber>> {
        match self.actor(Role::Subscriber).await {
            Some(RealmActor::Subscriber(actor)) => Some(actor),
            _ => None,
        }
    }

    pub async fn caller(&self) -> Option<Arc<dyn Caller>> {
        match self.actor(Role::Caller).await {
            Some(RealmActor::Caller(actor)) => Some(actor),
            _ => None,
        }
    }

    pub async fn callee(&self) -> Option<Arc<dyn Callee>> {
        match self.actor(Role::Callee).await {
            Some(RealmActor::Callee(actor)) => Some(actor),
            _ => None,
        }
    }

    /// Adds a session to the realm, sealing it.
    pub async fn join(&self, session: &Arc<Session>) {
        self.sealed.store(true, Ordering::Release);
        self.sessions
            .write()
            .await
            .insert(session.uuid(), Arc::downgrade(session));
        info!("Session {} joined realm {}", session.name(), self.uri());
    }

    /// Removes a session from the realm, letting every actor purge its state.
    ///
    /// Runs at most once per session.
    pub async fn leave(&self, session: &Arc<Session>) {
        if self.sessions.write().await.remove(&session.uuid()).is_none() {
            return;
        }
        let actors = self
            .actors
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for actor in actors {
            actor.done(session).await;
        }
        info!("Session {} left realm {}", session.name(), self.uri());
    }

    /// The number of sessions in the realm.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Shuts down the realm by attempting to end all sessions cleanly.
    pub async fn shut_down(&self, close_reason: CloseReason) -> Result<()> {
        let sessions = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(|session| session.upgrade())
            .collect::<Vec<_>>();
        let mut futures = Vec::default();
        for session in &sessions {
            if let Err(err) = session
                .send(goodbye_with_close_reason(close_reason))
                .await
            {
                warn!(
                    "Failed to send GOODBYE to session {} in realm {}: {err}",
                    session.name(),
                    self.uri()
                );
                continue;
            }
            futures.push(session.closed());
        }

        tokio::select! {
            _ = join_all(futures) => {},
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                return Err(Error::msg("timed out waiting for sessions to close cleanly"));
            }
        }
        Ok(())
    }
}

/// A manager for all realms served locally.
pub struct RealmManager {
    realms: RwLock<HashMap<Uri, Arc<Realm>>>,
    id_allocator: Box<dyn IdAllocator>,
}

impl Default for RealmManager {
    fn default() -> Self {
        Self {
            realms: RwLock::new(HashMap::default()),
            id_allocator: Box::new(RandomIdAllocator::default()),
        }
    }
}

impl RealmManager {
    /// Looks up realm by URI.
    pub async fn get(&self, uri: &Uri) -> Option<Arc<Realm>> {
        self.realms.read().await.get(uri).cloned()
    }

    /// Inserts a new realm.
    pub async fn insert(&self, realm: Realm) -> Result<Arc<Realm>> {
        let mut realms = self.realms.write().await;
        if realms.contains_key(realm.uri()) {
            return Err(
                BasicError::NotAllowed(format!("realm {} already exists", realm.uri())).into(),
            );
        }
        let realm = Arc::new(realm);
        realms.insert(realm.uri().clone(), realm.clone());
        Ok(realm)
    }

    /// Looks up a realm by URI, creating it if it does not exist.
    ///
    /// The returned flag is true if the realm was created.
    pub async fn get_or_create(&self, config: RealmConfig) -> (Arc<Realm>, bool) {
        let mut realms = self.realms.write().await;
        if let Some(realm) = realms.get(&config.uri) {
            return (realm.clone(), false);
        }
        let realm = Arc::new(Realm::new(config));
        realms.insert(realm.uri().clone(), realm.clone());
        (realm, true)
    }

    /// All realm URIs.
    pub async fn uris(&self) -> Vec<Uri> {
        self.realms.read().await.keys().cloned().collect()
    }

    /// Allocates a new session ID.
    pub fn generate_session_id(&self) -> Id {
        self.id_allocator.generate_id()
    }

    /// Shuts down all realms.
    pub async fn shut_down(&self, close_reason: CloseReason) -> Result<()> {
        let realms = self
            .realms
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut result = Ok(());
        for realm in realms {
            if let Err(err) = realm.shut_down(close_reason).await {
                warn!("Failed to shut down realm {}: {err}", realm.uri());
                result = Err(err);
            }
        }
        result
    }
}
