use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;
use log::{
    debug,
    info,
    warn,
};
use rand::Rng;
use uuid::Uuid;

use crate::{
    core::{
        cancel::CallCancelMode,
        error::{
            BasicError,
            InteractionError,
        },
        features::{
            Feature,
            FeatureSet,
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
        invocation_policy::InvocationPolicy,
        options::{
            CallOptions,
            InvocationDetails,
            ProcedureOptions,
        },
        roles::Role,
        types::{
            Dictionary,
            Value,
            flag,
        },
        uri::Uri,
    },
    message::{
        common::error_for,
        message::{
            CallMessage,
            CancelMessage,
            ErrorMessage,
            InterruptMessage,
            InvocationMessage,
            Message,
            RegisterMessage,
            RegisteredMessage,
            ResultMessage,
            UnregisterMessage,
            UnregisteredMessage,
            YieldMessage,
        },
    },
    realm::actor::{
        Actor,
        Dealer,
    },
    session::session::Session,
};

struct Registration {
    procedure: Uri,
    session: Arc<Session>,
    options: ProcedureOptions,
}

#[derive(Default)]
struct Procedures {
    registrations: HashMap<Id, Registration>,
    // In order of registration.
    by_procedure: HashMap<Uri, Vec<Id>>,
    round_robin: HashMap<Uri, usize>,
}

impl Procedures {
    fn validate_registration(
        &self,
        session: &Session,
        procedure: &Uri,
        options: &ProcedureOptions,
    ) -> Result<()> {
        let existing = match self.by_procedure.get(procedure) {
            Some(existing) => existing,
            None => return Ok(()),
        };
        for id in existing {
            let registration = match self.registrations.get(id) {
                Some(registration) => registration,
                None => continue,
            };
            let shared = options.invocation_policy.is_shared()
                && registration.options.invocation_policy == options.invocation_policy;
            if !shared || registration.session.uuid() == session.uuid() {
                return Err(InteractionError::ProcedureAlreadyExists.into());
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: Id) -> Option<Registration> {
        let registration = self.registrations.remove(&id)?;
        if let Some(ids) = self.by_procedure.get_mut(&registration.procedure) {
            ids.retain(|registered| *registered != id);
            if ids.is_empty() {
                self.by_procedure.remove(&registration.procedure);
                self.round_robin.remove(&registration.procedure);
            }
        }
        Some(registration)
    }

    fn select(&mut self, procedure: &Uri, tried: &HashSet<Id>) -> Option<Id> {
        let candidates = self
            .by_procedure
            .get(procedure)?
            .iter()
            .filter(|id| !tried.contains(id))
            .cloned()
            .collect::<Vec<_>>();
        let policy = self
            .registrations
            .get(candidates.first()?)?
            .options
            .invocation_policy;
        let counter = self.round_robin.entry(procedure.clone()).or_default();
        let index = select_index(policy, candidates.len(), counter);
        candidates.get(index).cloned()
    }
}

/// Selects the index of the callee to invoke among `len` candidates in order of registration.
fn select_index(policy: InvocationPolicy, len: usize, round_robin: &mut usize) -> usize {
    match policy {
        InvocationPolicy::Single | InvocationPolicy::First => 0,
        InvocationPolicy::Last => len - 1,
        InvocationPolicy::Random => rand::rng().random_range(0..len),
        InvocationPolicy::RoundRobin => {
            let index = *round_robin % len;
            *round_robin = round_robin.wrapping_add(1);
            index
        }
    }
}

struct PendingInvocation {
    caller: Arc<Session>,
    callee: Arc<Session>,
    registration: Id,
    call: CallMessage,
    options: CallOptions,
    tried: HashSet<Id>,
    receive_progress: bool,
}

#[derive(Default)]
struct Invocations {
    by_id: HashMap<Id, PendingInvocation>,
    by_call: HashMap<(Uuid, Id), Id>,
}

impl Invocations {
    fn insert(&mut self, id: Id, invocation: PendingInvocation) {
        self.by_call
            .insert((invocation.caller.uuid(), invocation.call.request), id);
        self.by_id.insert(id, invocation);
    }

    fn remove(&mut self, id: Id) -> Option<PendingInvocation> {
        let invocation = self.by_id.remove(&id)?;
        self.by_call
            .remove(&(invocation.caller.uuid(), invocation.call.request));
        Some(invocation)
    }

    fn remove_owned_by_callee(&mut self, callee: &Session, id: Id) -> Option<PendingInvocation> {
        let owned = self
            .by_id
            .get(&id)
            .is_some_and(|invocation| invocation.callee.uuid() == callee.uuid());
        if !owned {
            return None;
        }
        self.remove(id)
    }
}

/// The router's dealer, which routes calls to registered callees.
#[derive(Default)]
pub struct RouterDealer {
    procedures: Mutex<Procedures>,
    invocations: Mutex<Invocations>,
    registration_ids: SequentialIdAllocator,
    invocation_ids: SequentialIdAllocator,
}

impl RouterDealer {
    /// The number of registrations of a procedure.
    pub async fn callee_count(&self, procedure: &Uri) -> usize {
        self.procedures
            .lock()
            .await
            .by_procedure
            .get(procedure)
            .map(|ids| ids.len())
            .unwrap_or_default()
    }

    /// The number of invocations awaiting a result.
    pub async fn pending_invocations(&self) -> usize {
        self.invocations.lock().await.by_id.len()
    }

    /// Invokes the next untried callee of the call's procedure.
    async fn invoke(
        &self,
        caller: Arc<Session>,
        call: CallMessage,
        options: CallOptions,
        mut tried: HashSet<Id>,
    ) -> Result<()> {
        let (registration, callee, disclose_caller) = {
            let mut procedures = self.procedures.lock().await;
            let registration = procedures
                .select(&call.procedure, &tried)
                .ok_or(InteractionError::NoSuchProcedure)?;
            let selected = procedures.registrations.get(&registration).ok_or_else(|| {
                BasicError::Internal("selected registration does not exist".to_owned())
            })?;
            (
                registration,
                selected.session.clone(),
                selected.options.disclose_caller,
            )
        };
        tried.insert(registration);

        let receive_progress = options.receive_progress
            && callee
                .supports(Role::Dealer, Role::Callee, Feature::ProgressiveCallResults)
                .await;
        let timeout = match options.timeout {
            Some(timeout)
                if callee
                    .supports(Role::Dealer, Role::Callee, Feature::CallTimeout)
                    .await =>
            {
                Some(timeout)
            }
            _ => None,
        };
        let details = InvocationDetails {
            timeout,
            receive_progress,
            caller: if disclose_caller { caller.id() } else { None },
            procedure: Some(call.procedure.clone()),
        };

        let invocation = self.invocation_ids.generate_id();
        let message = Message::Invocation(InvocationMessage {
            request: invocation,
            registered_registration: registration,
            details: details.to_dictionary(),
            call_arguments: call.arguments.clone(),
            call_arguments_keyword: call.arguments_keyword.clone(),
        });
        self.invocations.lock().await.insert(
            invocation,
            PendingInvocation {
                caller,
                callee: callee.clone(),
                registration,
                call,
                options,
                tried,
                receive_progress,
            },
        );

        if let Err(err) = callee.send(message).await {
            self.invocations.lock().await.remove(invocation);
            return Err(err);
        }
        debug!(
            "Invocation {invocation} sent to session {} for registration {registration}",
            callee.name()
        );
        Ok(())
    }

    async fn send_to_caller(caller: &Arc<Session>, message: Message) {
        if let Err(err) = caller.send(message).await {
            warn!(
                "Failed to answer call for session {}: {err:#}",
                caller.name()
            );
        }
    }

    async fn interrupt(callee: &Arc<Session>, invocation: Id, mode: CallCancelMode) {
        if !callee
            .supports(Role::Dealer, Role::Callee, Feature::CallCanceling)
            .await
        {
            return;
        }
        if let Err(err) = callee
            .send(Message::Interrupt(InterruptMessage {
                invocation_request: invocation,
                options: Dictionary::from_iter([(
                    "mode".to_owned(),
                    Value::from(Into::<&'static str>::into(mode)),
                )]),
            }))
            .await
        {
            warn!(
                "Failed to interrupt invocation {invocation} on session {}: {err:#}",
                callee.name()
            );
        }
    }
}

#[async_trait]
impl Actor for RouterDealer {
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
            let ids = procedures
                .registrations
                .iter()
                .filter(|(_, registration)| registration.session.uuid() == session.uuid())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            for id in ids {
                procedures.remove(id);
            }
        }

        let orphaned = {
            let mut invocations = self.invocations.lock().await;
            let ids = invocations
                .by_id
                .iter()
                .filter(|(_, invocation)| {
                    invocation.callee.uuid() == session.uuid()
                        || invocation.caller.uuid() == session.uuid()
                })
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| invocations.remove(id).map(|invocation| (id, invocation)))
                .collect::<Vec<_>>()
        };
        for (id, invocation) in orphaned {
            if invocation.caller.uuid() != session.uuid() {
                info!(
                    "Canceling call {} for session {}, since its callee left",
                    invocation.call.request,
                    invocation.caller.name()
                );
                Self::send_to_caller(
                    &invocation.caller,
                    error_for(
                        Message::CALL_TAG,
                        invocation.call.request,
                        &InteractionError::Canceled.into(),
                    ),
                )
                .await;
            } else if invocation.callee.uuid() != session.uuid() {
                Self::interrupt(&invocation.callee, id, CallCancelMode::KillNoWait).await;
            }
        }
    }
}

#[async_trait]
impl Dealer for RouterDealer {
    async fn handle_register(
        &self,
        session: &Arc<Session>,
        message: &RegisterMessage,
    ) -> Result<()> {
        if message.procedure.is_reserved() {
            return Err(InteractionError::InvalidUri.into());
        }
        let options = ProcedureOptions::try_from(&message.options)?;
        let registration = self.registration_ids.generate_id();

        // REGISTERED goes out under the lock, so no invocation can reach the callee ahead of it.
        let mut procedures = self.procedures.lock().await;
        procedures.validate_registration(session, &message.procedure, &options)?;
        session
            .send(Message::Registered(RegisteredMessage {
                register_request: message.request,
                registration,
            }))
            .await?;
        procedures.registrations.insert(
            registration,
            Registration {
                procedure: message.procedure.clone(),
                session: session.clone(),
                options,
            },
        );
        procedures
            .by_procedure
            .entry(message.procedure.clone())
            .or_default()
            .push(registration);
        drop(procedures);

        debug!(
            "Session {} registered {} with registration {registration}",
            session.name(),
            message.procedure
        );
        Ok(())
    }

    async fn handle_unregister(
        &self,
        session: &Arc<Session>,
        message: &UnregisterMessage,
    ) -> Result<()> {
        {
            let mut procedures = self.procedures.lock().await;
            let owned = procedures
                .registrations
                .get(&message.registered_registration)
                .is_some_and(|registration| registration.session.uuid() == session.uuid());
            if !owned {
                return Err(InteractionError::NoSuchRegistration.into());
            }
            procedures.remove(message.registered_registration);
        }
        session
            .send(Message::Unregistered(UnregisteredMessage {
                unregister_request: message.request,
            }))
            .await
    }

    async fn handle_call(&self, session: &Arc<Session>, message: &CallMessage) -> Result<()> {
        let options = CallOptions::from(&message.options);
        self.invoke(session.clone(), message.clone(), options, HashSet::default())
            .await
    }

    async fn handle_cancel(&self, session: &Arc<Session>, message: &CancelMessage) -> Result<()> {
        let mode = match message.options.get("mode") {
            Some(Value::String(mode)) => CallCancelMode::try_from(mode.as_str())
                .map_err(|err| BasicError::InvalidArgument(err.to_string()))?,
            Some(_) => {
                return Err(BasicError::InvalidArgument("mode must be a string".to_owned()).into());
            }
            None => CallCancelMode::default(),
        };
        let canceled = {
            let mut invocations = self.invocations.lock().await;
            match invocations
                .by_call
                .get(&(session.uuid(), message.call_request))
                .cloned()
            {
                Some(id) => invocations.remove(id).map(|invocation| (id, invocation)),
                None => None,
            }
        };
        // The call may have already finished, in which case the caller has its answer.
        let (id, invocation) = match canceled {
            Some(canceled) => canceled,
            None => return Ok(()),
        };

        Self::send_to_caller(
            session,
            error_for(
                Message::CALL_TAG,
                message.call_request,
                &InteractionError::Canceled.into(),
            ),
        )
        .await;
        if mode.interrupts_callee() {
            Self::interrupt(&invocation.callee, id, mode).await;
        }
        Ok(())
    }

    async fn handle_yield(&self, session: &Arc<Session>, message: &YieldMessage) -> Result<()> {
        let progress = flag(&message.options, "progress");
        let (caller, call_request, receive_progress) = {
            let mut invocations = self.invocations.lock().await;
            let owned = invocations
                .by_id
                .get(&message.invocation_request)
                .filter(|invocation| invocation.callee.uuid() == session.uuid())
                .map(|invocation| {
                    (
                        invocation.caller.clone(),
                        invocation.call.request,
                        invocation.receive_progress,
                    )
                });
            let owned = owned.ok_or_else(|| {
                BasicError::NotFound(format!(
                    "no invocation {} for session",
                    message.invocation_request
                ))
            })?;
            if !progress {
                invocations.remove(message.invocation_request);
            }
            owned
        };

        if progress && !receive_progress {
            return Ok(());
        }
        let mut details = Dictionary::default();
        if progress {
            details.insert("progress".to_owned(), Value::Bool(true));
        }
        Self::send_to_caller(
            &caller,
            Message::Result(ResultMessage {
                call_request,
                details,
                yield_arguments: message.arguments.clone(),
                yield_arguments_keyword: message.arguments_keyword.clone(),
            }),
        )
        .await;
        Ok(())
    }

    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()> {
        if message.request_type != Message::INVOCATION_TAG {
            return Err(BasicError::InvalidArgument(format!(
                "unexpected ERROR for request type {}",
                message.request_type
            ))
            .into());
        }
        let invocation = self
            .invocations
            .lock()
            .await
            .remove_owned_by_callee(session, message.request)
            .ok_or_else(|| {
                BasicError::NotFound(format!("no invocation {} for session", message.request))
            })?;

        if message.error == InteractionError::Unavailable.uri() {
            debug!(
                "Callee {} is unavailable for registration {}, rerouting",
                session.name(),
                invocation.registration
            );
            let caller = invocation.caller.clone();
            let call_request = invocation.call.request;
            match self
                .invoke(
                    invocation.caller,
                    invocation.call,
                    invocation.options,
                    invocation.tried,
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(err)
                    if err
                        .downcast_ref::<InteractionError>()
                        .is_some_and(|err| matches!(err, InteractionError::NoSuchProcedure)) =>
                {
                    // No callee is left to try, so the caller sees the last callee's answer.
                }
                Err(err) => {
                    Self::send_to_caller(&caller, error_for(Message::CALL_TAG, call_request, &err))
                        .await;
                    return Ok(());
                }
            }
            Self::send_to_caller(
                &caller,
                Message::Error(ErrorMessage {
                    request_type: Message::CALL_TAG,
                    request: call_request,
                    details: message.details.clone(),
                    error: message.error.clone(),
                    arguments: message.arguments.clone(),
                    arguments_keyword: message.arguments_keyword.clone(),
                }),
            )
            .await;
            return Ok(());
        }

        Self::send_to_caller(
            &invocation.caller,
            Message::Error(ErrorMessage {
                request_type: Message::CALL_TAG,
                request: invocation.call.request,
                details: message.details.clone(),
                error: message.error.clone(),
                arguments: message.arguments.clone(),
                arguments_keyword: message.arguments_keyword.clone(),
            }),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod dealer_test {
    use crate::{
        core::invocation_policy::InvocationPolicy,
        router::dealer::select_index,
    };

    #[test]
    fn selects_callees_by_policy() {
        let mut counter = 0;
        pretty_assertions::assert_eq!(select_index(InvocationPolicy::Single, 1, &mut counter), 0);
        pretty_assertions::assert_eq!(select_index(InvocationPolicy::First, 3, &mut counter), 0);
        pretty_assertions::assert_eq!(select_index(InvocationPolicy::Last, 3, &mut counter), 2);
        pretty_assertions::assert_eq!(counter, 0);
        let picks = (0..4)
            .map(|_| select_index(InvocationPolicy::RoundRobin, 3, &mut counter))
            .collect::<Vec<_>>();
        pretty_assertions::assert_eq!(picks, vec![0, 1, 2, 0]);
        for _ in 0..16 {
            assert!(select_index(InvocationPolicy::Random, 3, &mut counter) < 3);
        }
    }
}
