use std::{
    sync::{
        Arc,
        atomic::AtomicBool,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;
use log::{
    debug,
    warn,
};
use tokio::sync::{
    mpsc::unbounded_channel,
    oneshot,
};
use uuid::Uuid;

use crate::{
    core::{
        error::{
            BasicError,
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
        options::{
            InvocationDetails,
            ProcedureOptions,
        },
        roles::Role,
        uri::Uri,
    },
    dispatch::flow::DispatchStatus,
    message::message::{
        ErrorMessage,
        InterruptMessage,
        InvocationMessage,
        Message,
        RegisterMessage,
        RegisteredMessage,
        UnregisterMessage,
        UnregisteredMessage,
    },
    peer::{
        callee::{
            call_manager::{
                CallManager,
                PendingCall,
            },
            executor::Executor,
            invocation::{
                Invocation,
                ProcedureHandler,
            },
        },
        canceled_error,
    },
    realm::actor::{
        Actor,
        Callee,
    },
    session::session::Session,
    stats::statistics::StatisticsRegistry,
};

/// Configuration for the callee role of a peer.
#[derive(Debug, Clone)]
pub struct CalleeConfig {
    /// The maximum number of invocations running at once.
    pub max_concurrent_tasks: usize,
    /// The maximum number of invocations admitted at once, running or delayed.
    pub max_queued_tasks: usize,
    /// How often in-flight invocations are advanced.
    pub sweep_interval: Duration,
    /// Invocations are canceled when they run past the timeout requested by the caller.
    pub enforce_timeouts: bool,
    /// A saturated callee asks the dealer to reroute invocations instead of holding them back.
    pub allow_reroute: bool,
}

impl Default for CalleeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 16,
            max_queued_tasks: 256,
            sweep_interval: Duration::from_millis(5),
            enforce_timeouts: true,
            allow_reroute: true,
        }
    }
}

impl CalleeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(BasicError::InvalidArgument(
                "max_concurrent_tasks must be positive".to_owned(),
            )
            .into());
        }
        if self.max_queued_tasks == 0 {
            return Err(
                BasicError::InvalidArgument("max_queued_tasks must be positive".to_owned()).into(),
            );
        }
        if self.sweep_interval.is_zero() {
            return Err(
                BasicError::InvalidArgument("sweep_interval must be positive".to_owned()).into(),
            );
        }
        Ok(())
    }
}

struct PendingRegistration {
    procedure: Uri,
    handler: Arc<dyn ProcedureHandler>,
    tx: oneshot::Sender<ChannelTransmittableResult<Id>>,
}

struct RegisteredProcedure {
    procedure: Uri,
    handler: Arc<dyn ProcedureHandler>,
}

struct PendingUnregistration {
    registration: Id,
    tx: oneshot::Sender<ChannelTransmittableResult<()>>,
}

#[derive(Default)]
struct Procedures {
    pending_registrations: HashMap<(Uuid, Id), PendingRegistration>,
    pending_unregistrations: HashMap<(Uuid, Id), PendingUnregistration>,
    registered: HashMap<(Uuid, Id), RegisteredProcedure>,
}

/// The peer's callee, which runs registered procedures for invocations.
pub struct PeerCallee {
    procedures: Mutex<Procedures>,
    calls: Arc<CallManager>,
    statistics: Arc<StatisticsRegistry>,
}

impl PeerCallee {
    /// Creates a new callee and starts its call sweep.
    pub fn new(config: CalleeConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        let calls = Arc::new(CallManager::new(config, executor));
        calls.start();
        Ok(Self {
            procedures: Mutex::new(Procedures::default()),
            calls,
            statistics: Arc::new(StatisticsRegistry::default()),
        })
    }

    /// Statistics for every procedure run by the callee.
    pub fn statistics(&self) -> &Arc<StatisticsRegistry> {
        &self.statistics
    }

    /// The call-lifecycle manager of the callee.
    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    /// Stops running invocations for good.
    pub async fn stop(&self) {
        self.calls.stop().await;
    }

    /// Registers a procedure, returning the registration ID once the dealer confirms it.
    pub async fn register(
        &self,
        session: &Arc<Session>,
        procedure: Uri,
        options: ProcedureOptions,
        handler: Arc<dyn ProcedureHandler>,
    ) -> Result<Id> {
        if !session.is_established() {
            return Err(BasicError::NotAllowed(format!(
                "cannot register {procedure} before the session is established"
            ))
            .into());
        }
        let request = session.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.procedures.lock().await.pending_registrations.insert(
            (session.uuid(), request),
            PendingRegistration {
                procedure: procedure.clone(),
                handler,
                tx,
            },
        );
        if let Err(err) = session
            .send_request(Message::Register(RegisterMessage {
                request,
                options: options.to_dictionary(),
                procedure,
            }))
            .await
        {
            self.procedures
                .lock()
                .await
                .pending_registrations
                .remove(&(session.uuid(), request));
            return Err(err);
        }
        rx.await
            .map_err(|_| InteractionError::Canceled)?
            .map_err(|err| err.into_error())
    }

    /// Unregisters a procedure.
    pub async fn unregister(&self, session: &Arc<Session>, registration: Id) -> Result<()> {
        let request = session.next_request_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut procedures = self.procedures.lock().await;
            if !procedures
                .registered
                .contains_key(&(session.uuid(), registration))
            {
                return Err(InteractionError::NoSuchRegistration.into());
            }
            procedures.pending_unregistrations.insert(
                (session.uuid(), request),
                PendingUnregistration { registration, tx },
            );
        }
        if let Err(err) = session
            .send_request(Message::Unregister(UnregisterMessage {
                request,
                registered_registration: registration,
            }))
            .await
        {
            self.procedures
                .lock()
                .await
                .pending_unregistrations
                .remove(&(session.uuid(), request));
            return Err(err);
        }
        rx.await
            .map_err(|_| InteractionError::Canceled)?
            .map_err(|err| err.into_error())
    }
}

#[async_trait]
impl Actor for PeerCallee {
    fn supported_features(&self) -> FeatureSet {
        FeatureSet::from_iter([
            Feature::ProgressiveCallResults,
            Feature::CallTimeout,
            Feature::CallCanceling,
            Feature::CallerIdentification,
            Feature::SharedRegistration,
            Feature::CallReroute,
        ])
    }

    async fn done(&self, session: &Arc<Session>) {
        {
            let mut procedures = self.procedures.lock().await;
            let uuid = session.uuid();
            procedures.registered.retain(|(owner, _), _| *owner != uuid);
            let requests = procedures
                .pending_registrations
                .keys()
                .filter(|(owner, _)| *owner == uuid)
                .cloned()
                .collect::<Vec<_>>();
            for request in requests {
                if let Some(pending) = procedures.pending_registrations.remove(&request) {
                    pending.tx.send(Err(canceled_error())).ok();
                }
            }
            let requests = procedures
                .pending_unregistrations
                .keys()
                .filter(|(owner, _)| *owner == uuid)
                .cloned()
                .collect::<Vec<_>>();
            for request in requests {
                if let Some(pending) = procedures.pending_unregistrations.remove(&request) {
                    pending.tx.send(Err(canceled_error())).ok();
                }
            }
        }
        self.calls.done(session).await;
    }
}

#[async_trait]
impl Callee for PeerCallee {
    async fn handle_registered(
        &self,
        session: &Arc<Session>,
        message: &RegisteredMessage,
    ) -> Result<()> {
        let mut procedures = self.procedures.lock().await;
        let pending = match procedures
            .pending_registrations
            .remove(&(session.uuid(), message.register_request))
        {
            Some(pending) => pending,
            None => return Ok(()),
        };
        debug!(
            "Session {} registered {} with registration {}",
            session.name(),
            pending.procedure,
            message.registration
        );
        procedures.registered.insert(
            (session.uuid(), message.registration),
            RegisteredProcedure {
                procedure: pending.procedure,
                handler: pending.handler,
            },
        );
        pending.tx.send(Ok(message.registration)).ok();
        Ok(())
    }

    async fn handle_unregistered(
        &self,
        session: &Arc<Session>,
        message: &UnregisteredMessage,
    ) -> Result<()> {
        let mut procedures = self.procedures.lock().await;
        let pending = match procedures
            .pending_unregistrations
            .remove(&(session.uuid(), message.unregister_request))
        {
            Some(pending) => pending,
            None => return Ok(()),
        };
        procedures
            .registered
            .remove(&(session.uuid(), pending.registration));
        pending.tx.send(Ok(())).ok();
        Ok(())
    }

    async fn handle_invocation(
        &self,
        session: &Arc<Session>,
        message: &InvocationMessage,
    ) -> Result<DispatchStatus> {
        let details = InvocationDetails::from(&message.details);
        let registered = self
            .procedures
            .lock()
            .await
            .registered
            .get(&(session.uuid(), message.registered_registration))
            .map(|registered| (registered.procedure.clone(), registered.handler.clone()));
        let (procedure, handler) = match registered {
            Some(registered) => registered,
            None => {
                let key = details
                    .procedure
                    .as_ref()
                    .map(|procedure| procedure.to_string())
                    .unwrap_or_else(|| message.registered_registration.to_string());
                warn!(
                    "Session {} received invocation for unknown registration {} ({key})",
                    session.name(),
                    message.registered_registration
                );
                self.statistics.record_not_found(&key).await;
                return Ok(DispatchStatus::Ignored);
            }
        };

        let receive_progress = details.receive_progress
            && session
                .supports(Role::Callee, Role::Dealer, Feature::ProgressiveCallResults)
                .await;
        let (progress_tx, progress_rx) = if receive_progress {
            let (tx, rx) = unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let statistics = self.statistics.procedure(&procedure).await;
        self.calls
            .admit(PendingCall {
                session: session.clone(),
                handler,
                invocation: Invocation {
                    procedure,
                    registration: message.registered_registration,
                    request: message.request,
                    arguments: message.call_arguments.clone(),
                    arguments_keyword: message.call_arguments_keyword.clone(),
                    details,
                    progress_tx,
                    canceled: Arc::new(AtomicBool::new(false)),
                },
                progress_rx,
                statistics,
            })
            .await
    }

    async fn handle_interrupt(
        &self,
        session: &Arc<Session>,
        message: &InterruptMessage,
    ) -> Result<()> {
        if !self
            .calls
            .interrupt(session, message.invocation_request)
            .await
        {
            debug!(
                "Session {} received INTERRUPT for finished invocation {}",
                session.name(),
                message.invocation_request
            );
        }
        Ok(())
    }

    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()> {
        let error = ChannelTransmittableError::try_from(&Message::Error(message.clone()))?;
        let mut procedures = self.procedures.lock().await;
        let key = (session.uuid(), message.request);
        match message.request_type {
            Message::REGISTER_TAG => {
                if let Some(pending) = procedures.pending_registrations.remove(&key) {
                    pending.tx.send(Err(error)).ok();
                }
            }
            Message::UNREGISTER_TAG => {
                if let Some(pending) = procedures.pending_unregistrations.remove(&key) {
                    pending.tx.send(Err(error)).ok();
                }
            }
            request_type => {
                warn!("Callee received ERROR for unexpected request type {request_type}")
            }
        }
        Ok(())
    }
}
