use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
};

use anyhow::{
    Error,
    Result,
};
use futures_util::lock::Mutex;
use log::{
    debug,
    info,
    warn,
};
use tokio::sync::{
    RwLock,
    watch,
};
use uuid::Uuid;

use crate::{
    core::{
        close::CloseReason,
        error::{
            BasicError,
            ChannelTransmittableError,
            InteractionError,
        },
        features::{
            Feature,
            FeatureSet,
            negotiate_features,
        },
        hash::{
            HashMap,
            HashSet,
        },
        id::{
            Id,
            IdAllocator,
            SequentialIdAllocator,
        },
        roles::{
            Role,
            expand_roles,
        },
        types::Integer,
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            goodbye_with_close_reason,
        },
        message::{
            HelloMessage,
            Message,
        },
    },
    realm::realm::{
        Realm,
        RealmManager,
    },
    session::party::Party,
    transport::transport::Transport,
};

/// The default agent name, communicated to the other side of a session.
pub const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Configuration for one end of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the session, mostly for logging.
    pub name: String,
    /// Agent name, communicated to the other side.
    pub agent: String,
    /// Roles the session may take on. Aggregate roles are expanded.
    pub roles: Vec<Role>,
    /// Features the session may advertise. All implemented features are advertised if unset.
    pub features: Option<FeatureSet>,
    /// Opaque identity token, sent as `authid` in HELLO.
    pub identity: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT.to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            roles: Vec::default(),
            features: None,
            identity: None,
        }
    }
}

/// The lifecycle state of a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Open,
    Established,
    Closing,
    Closed,
}

impl SessionState {
    fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Open, Self::Established) => true,
            (Self::Open, Self::Closed) => true,
            (Self::Established, Self::Closing) => true,
            (Self::Established, Self::Closed) => true,
            (Self::Closing, Self::Closed) => true,
            _ => false,
        }
    }
}

/// One end of a WAMP session over a transport.
///
/// Holds identity, the parties on both ends, the lifecycle state, and the table of requests
/// awaiting a correlated response. The same type serves router and client ends; which messages
/// are legal follows from the local roles.
pub struct Session {
    uuid: Uuid,
    config: SessionConfig,
    local_roles: HashSet<Role>,
    transport: Arc<dyn Transport>,
    realms: Arc<RealmManager>,
    request_ids: SequentialIdAllocator,
    state_tx: watch::Sender<SessionState>,
    id: AtomicU64,
    realm: RwLock<Option<Arc<Realm>>>,
    local: RwLock<Party>,
    remote: RwLock<Option<Party>>,
    pending: Mutex<HashMap<Id, Integer>>,
    close_error: Mutex<Option<ChannelTransmittableError>>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uuid", &self.uuid)
            .field("name", &self.config.name)
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Creates a new session in the open state.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        realms: Arc<RealmManager>,
    ) -> Self {
        let local_roles = expand_roles(&config.roles);
        let (state_tx, _) = watch::channel(SessionState::default());
        Self {
            uuid: Uuid::new_v4(),
            config,
            local_roles,
            transport,
            realms,
            request_ids: SequentialIdAllocator::default(),
            state_tx,
            id: AtomicU64::new(0),
            realm: RwLock::new(None),
            local: RwLock::new(Party::default()),
            remote: RwLock::new(None),
            pending: Mutex::new(HashMap::default()),
            close_error: Mutex::new(None),
        }
    }

    /// The unique identifier of the session object, stable for its whole lifecycle.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Name of the session, mostly for logging.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The realms the session may join or serve.
    pub fn realms(&self) -> &Arc<RealmManager> {
        &self.realms
    }

    /// The concrete roles the session may take on.
    pub fn local_roles(&self) -> &HashSet<Role> {
        &self.local_roles
    }

    /// Checks if the session may take on the role.
    pub fn has_local_role(&self, role: Role) -> bool {
        self.local_roles.contains(&role)
    }

    /// Checks if the session is the router end.
    pub fn is_router(&self) -> bool {
        self.local_roles.iter().any(|role| role.is_router_role())
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Checks if the session is established.
    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// The session ID, assigned by the router on establishment.
    pub fn id(&self) -> Option<Id> {
        Id::try_from(self.id.load(Ordering::Acquire)).ok()
    }

    /// The realm the session joined.
    pub async fn realm(&self) -> Option<Arc<Realm>> {
        self.realm.read().await.clone()
    }

    /// The local party, as advertised to the other side.
    pub async fn local_party(&self) -> Party {
        self.local.read().await.clone()
    }

    /// The remote party, as advertised by the other side.
    pub async fn remote_party(&self) -> Option<Party> {
        self.remote.read().await.clone()
    }

    /// Checks if the remote party advertised the feature under the role.
    pub async fn remote_supports(&self, remote_role: Role, feature: Feature) -> bool {
        self.remote
            .read()
            .await
            .as_ref()
            .is_some_and(|remote| remote.supports(remote_role, feature))
    }

    /// Checks if a feature is supported on the session: advertised locally under the local role
    /// and by the remote party under the remote role.
    pub async fn supports(&self, local_role: Role, remote_role: Role, feature: Feature) -> bool {
        self.local.read().await.supports(local_role, feature)
            && self.remote_supports(remote_role, feature).await
    }

    /// The local party to advertise in a realm: every local role with an actor in the realm, with
    /// features negotiated against configuration.
    pub async fn local_party_for(&self, realm: &Realm) -> Party {
        let mut roles = HashMap::default();
        for role in &self.local_roles {
            if let Some(supported) = realm.supported_features(*role).await {
                roles.insert(
                    *role,
                    negotiate_features(*role, &supported, self.config.features.as_ref()),
                );
            }
        }
        Party {
            agent: self.config.agent.clone(),
            roles,
            identity: self.config.identity.clone(),
        }
    }

    /// Generates a new request ID.
    pub fn next_request_id(&self) -> Id {
        self.request_ids.generate_id()
    }

    /// Sends a message over the session, transitioning state for session-ending messages.
    pub async fn send(self: &Arc<Self>, message: Message) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Err(BasicError::NotAllowed(format!(
                "cannot send {} message on closed session {}",
                message.message_name(),
                self.name()
            ))
            .into());
        }
        self.transition_state_from_sending_message(&message).await?;
        debug!("Session {} sending message: {message:?}", self.name());
        self.transport.send(message).await
    }

    /// Sends a request, registering a pending entry that its response must match.
    pub async fn send_request(self: &Arc<Self>, message: Message) -> Result<Id> {
        let request = message.request_id().ok_or_else(|| {
            BasicError::InvalidArgument(format!(
                "{} message is not a request",
                message.message_name()
            ))
        })?;
        let request_type = message.tag();
        self.pending.lock().await.insert(request, request_type);
        if let Err(err) = self.send(message).await {
            self.pending.lock().await.remove(&request);
            return Err(err);
        }
        Ok(request)
    }

    /// Removes the pending entry for a response, if it exists and was created by a request of the
    /// given type.
    pub async fn take_pending(&self, request: Id, request_type: Integer) -> bool {
        let mut pending = self.pending.lock().await;
        if pending.get(&request) == Some(&request_type) {
            pending.remove(&request);
            true
        } else {
            false
        }
    }

    /// Checks if a pending entry exists for a response without removing it.
    pub async fn matches_pending(&self, request: Id, request_type: Integer) -> bool {
        self.pending.lock().await.get(&request) == Some(&request_type)
    }

    /// The number of requests awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn transition_state_from_sending_message(self: &Arc<Self>, message: &Message) -> Result<()> {
        let next_state = match message {
            Message::Abort(_) => SessionState::Closed,
            Message::Goodbye(_) => match self.state() {
                SessionState::Closing => SessionState::Closed,
                _ => SessionState::Closing,
            },
            _ => return Ok(()),
        };
        self.transition_state(next_state).await
    }

    /// Moves the session to the next state.
    ///
    /// Entering the closed state clears pending requests and removes the session from its realm.
    pub async fn transition_state(self: &Arc<Self>, next: SessionState) -> Result<()> {
        let mut error = None;
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.allowed_state_transition(&next) {
                error = Some(Error::msg(format!(
                    "invalid state transition from {state:?} to {next:?}"
                )));
                return false;
            }
            debug!(
                "Session {} transitioned from {state:?} to {next:?}",
                self.config.name
            );
            *state = next;
            true
        });
        if let Some(err) = error {
            return Err(err);
        }
        if changed && next == SessionState::Closed {
            self.clean_up().await;
        }
        Ok(())
    }

    async fn clean_up(self: &Arc<Self>) {
        self.pending.lock().await.clear();
        if let Some(realm) = self.realm().await {
            realm.leave(self).await;
        }
    }

    /// Marks the session established.
    pub async fn establish(
        self: &Arc<Self>,
        id: Id,
        realm: Arc<Realm>,
        local: Party,
        remote: Party,
    ) -> Result<()> {
        self.id.store(id.value(), Ordering::Release);
        *self.local.write().await = local;
        *self.remote.write().await = Some(remote);
        *self.realm.write().await = Some(realm.clone());
        self.transition_state(SessionState::Established).await?;
        realm.join(self).await;
        Ok(())
    }

    /// Records why the session ended.
    pub async fn set_close_error(&self, error: ChannelTransmittableError) {
        self.close_error.lock().await.replace(error);
    }

    /// Why the session ended, if it ended abnormally.
    pub async fn close_error(&self) -> Option<ChannelTransmittableError> {
        self.close_error.lock().await.clone()
    }

    /// Aborts the session with an error.
    pub async fn abort(self: &Arc<Self>, error: &Error) -> Result<()> {
        warn!("Aborting session {}: {error:#}", self.name());
        self.set_close_error(error.into()).await;
        self.send(abort_message_for_error(error)).await
    }

    /// Closes the session immediately, without any handshake.
    pub async fn close_now(self: &Arc<Self>) -> Result<()> {
        self.transition_state(SessionState::Closed).await
    }

    /// Waits for the session to close.
    pub async fn closed(&self) {
        let mut state_rx = self.state_tx.subscribe();
        state_rx
            .wait_for(|state| *state == SessionState::Closed)
            .await
            .ok();
    }

    /// Joins a realm from the client end by sending HELLO and waiting for the router's answer.
    pub async fn join(self: &Arc<Self>, realm: Uri) -> Result<Id> {
        if self.state() != SessionState::Open {
            return Err(BasicError::NotAllowed(format!(
                "session {} is not open",
                self.name()
            ))
            .into());
        }
        let realm = self
            .realms
            .get(&realm)
            .await
            .ok_or(InteractionError::NoSuchRealm)?;
        let local = self.local_party_for(&realm).await;
        if local.roles.is_empty() {
            return Err(InteractionError::NoSuchRole.into());
        }
        let details = local.to_details();
        *self.local.write().await = local;
        *self.realm.write().await = Some(realm.clone());

        let mut state_rx = self.state_tx.subscribe();
        self.send(Message::Hello(HelloMessage {
            realm: realm.uri().clone(),
            details,
        }))
        .await?;
        let state = *state_rx
            .wait_for(|state| *state != SessionState::Open)
            .await?;
        match (state, self.id()) {
            (SessionState::Established, Some(id)) => {
                info!(
                    "Session {} joined realm {} with id {id}",
                    self.name(),
                    realm.uri()
                );
                Ok(id)
            }
            _ => Err(self
                .close_error()
                .await
                .map(|err| err.into_error())
                .unwrap_or_else(|| Error::msg("session closed before it was established"))),
        }
    }

    /// Leaves the realm from either end by sending GOODBYE, then waits for the session to close.
    pub async fn leave(self: &Arc<Self>, close_reason: CloseReason) -> Result<()> {
        match self.state() {
            SessionState::Established => {
                self.send(goodbye_with_close_reason(close_reason)).await?;
            }
            SessionState::Closing => (),
            SessionState::Open => return self.close_now().await,
            SessionState::Closed => return Ok(()),
        }
        self.closed().await;
        Ok(())
    }
}
