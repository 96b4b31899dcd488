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

use anyhow::Result;
use futures_util::lock::Mutex;
use log::{
    debug,
    error,
    warn,
};
use tokio::{
    sync::{
        Notify,
        mpsc::UnboundedReceiver,
    },
    task::JoinHandle,
    time::{
        Instant,
        MissedTickBehavior,
    },
};
use uuid::Uuid;

use crate::{
    core::{
        error::{
            InteractionError,
            InvocationError,
        },
        features::Feature,
        hash::HashMap,
        id::Id,
        roles::Role,
        types::{
            Dictionary,
            Value,
        },
    },
    dispatch::flow::DispatchStatus,
    message::{
        common::{
            error_for,
            error_with_trace_for,
        },
        message::{
            Message,
            YieldMessage,
        },
    },
    peer::callee::{
        callee::CalleeConfig,
        executor::{
            CallFuture,
            Executor,
        },
        invocation::{
            Invocation,
            ProcedureHandler,
            RpcYield,
        },
    },
    session::session::Session,
    stats::statistics::{
        CallOutcome,
        ProcedureStatistics,
    },
};

/// An invocation waiting to be admitted.
pub(crate) struct PendingCall {
    pub session: Arc<Session>,
    pub handler: Arc<dyn ProcedureHandler>,
    pub invocation: Invocation,
    pub progress_rx: Option<UnboundedReceiver<RpcYield>>,
    pub statistics: Arc<ProcedureStatistics>,
}

enum CallState {
    /// Admitted, waiting for a free worker.
    Delayed(Arc<dyn ProcedureHandler>, Invocation),
    Running(CallFuture),
    /// The executor refused the call.
    Unassigned,
}

struct Call {
    session: Arc<Session>,
    request: Id,
    state: CallState,
    admitted: Instant,
    deadline: Option<Instant>,
    /// Canceled for running past its deadline. Answered by the next sweep.
    timed_out: bool,
    progress_rx: Option<UnboundedReceiver<RpcYield>>,
    statistics: Arc<ProcedureStatistics>,
}

impl Call {
    fn is_running(&self) -> bool {
        matches!(self.state, CallState::Running(_))
    }

    fn finish(&self, outcome: CallOutcome) {
        self.statistics.record(outcome, self.admitted.elapsed());
    }

    fn drain_progress(&mut self, replies: &mut Vec<(Arc<Session>, Message)>) {
        if let Some(progress_rx) = &mut self.progress_rx {
            while let Ok(result) = progress_rx.try_recv() {
                replies.push((
                    self.session.clone(),
                    yield_message(self.request, result, true),
                ));
            }
        }
    }
}

fn yield_message(request: Id, result: RpcYield, progress: bool) -> Message {
    let mut options = Dictionary::default();
    if progress {
        options.insert("progress".to_owned(), Value::Bool(true));
    }
    Message::Yield(YieldMessage {
        invocation_request: request,
        options,
        arguments: result.arguments,
        arguments_keyword: result.arguments_keyword,
    })
}

fn invocation_error(request: Id, error: InvocationError) -> Message {
    error_for(Message::INVOCATION_TAG, request, &error.into())
}

/// A finished future whose result still has to be read.
struct FinishedCall {
    call: Call,
    future: CallFuture,
}

/// Drives the lifecycle of every invocation admitted by a callee.
///
/// Calls are admitted up to a hard ceiling and run on the executor up to a concurrency limit. A
/// periodic sweep replies to finished and canceled calls, then promotes delayed calls when workers
/// free up. A running call past its deadline is canceled first and answered on the following sweep.
pub struct CallManager {
    config: CalleeConfig,
    executor: Arc<dyn Executor>,
    calls: Mutex<HashMap<(Uuid, Id), Call>>,
    wake: Arc<Notify>,
    stopped: AtomicBool,
    sweep_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    /// Creates a new call manager. The sweep does not run until [`Self::start`].
    pub fn new(config: CalleeConfig, executor: Arc<dyn Executor>) -> Self {
        Self {
            config,
            executor,
            calls: Mutex::new(HashMap::default()),
            wake: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
            sweep_handle: std::sync::Mutex::new(None),
        }
    }

    /// Starts the periodic sweep.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let wake = self.wake.clone();
        let handle = tokio::spawn(Self::sweep_loop(
            manager,
            wake,
            self.config.sweep_interval,
        ));
        match self.sweep_handle.lock() {
            Ok(mut sweep_handle) => {
                if let Some(previous) = sweep_handle.replace(handle) {
                    previous.abort();
                }
            }
            Err(_) => error!("Call manager sweep handle is poisoned"),
        }
    }

    async fn sweep_loop(manager: Weak<CallManager>, wake: Arc<Notify>, interval: Duration) {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => (),
                _ = wake.notified() => (),
            }
            let manager = match manager.upgrade() {
                Some(manager) => manager,
                None => break,
            };
            if manager.stopped.load(Ordering::Acquire) {
                break;
            }
            manager.sweep().await;
        }
        debug!("Call manager sweep finished");
    }

    /// Stops the sweep, cancels every call, and shuts the executor down.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
        let calls = self
            .calls
            .lock()
            .await
            .drain()
            .map(|(_, call)| call)
            .collect::<Vec<_>>();
        for call in calls {
            if let CallState::Running(future) = &call.state {
                future.cancel(true);
            }
            call.finish(CallOutcome::Canceled);
        }
        self.executor.shut_down();
    }

    /// The number of admitted calls, delayed or running.
    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// The number of running calls.
    pub async fn running_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .values()
            .filter(|call| call.is_running())
            .count()
    }

    fn start_call(&self, handler: Arc<dyn ProcedureHandler>, invocation: Invocation) -> CallState {
        let request = invocation.request;
        match self.executor.execute(handler, invocation) {
            Ok(future) => CallState::Running(future),
            Err(err) => {
                warn!("Executor refused invocation {request}: {err:#}");
                CallState::Unassigned
            }
        }
    }

    /// Admits an invocation.
    ///
    /// When the callee is saturated, the invocation is answered with `wamp.error.unavailable` if
    /// the dealer can reroute it, and reported busy otherwise.
    pub(crate) async fn admit(&self, call: PendingCall) -> Result<DispatchStatus> {
        let reroute = self.config.allow_reroute
            && call
                .session
                .supports(Role::Callee, Role::Dealer, Feature::CallReroute)
                .await;
        let timeouts = self.config.enforce_timeouts
            && call
                .session
                .supports(Role::Callee, Role::Dealer, Feature::CallTimeout)
                .await;
        let request = call.invocation.request;
        let saturated = {
            let mut calls = self.calls.lock().await;
            if calls.len() >= self.config.max_queued_tasks {
                true
            } else {
                let deadline = match call.invocation.details.timeout {
                    Some(timeout) if timeouts => Some(Instant::now() + timeout),
                    _ => None,
                };
                let running = calls.values().filter(|call| call.is_running()).count();
                let state = if running < self.config.max_concurrent_tasks {
                    self.start_call(call.handler, call.invocation)
                } else {
                    CallState::Delayed(call.handler, call.invocation)
                };
                calls.insert(
                    (call.session.uuid(), request),
                    Call {
                        session: call.session.clone(),
                        request,
                        state,
                        admitted: Instant::now(),
                        deadline,
                        timed_out: false,
                        progress_rx: call.progress_rx,
                        statistics: call.statistics,
                    },
                );
                false
            }
        };

        if !saturated {
            self.wake.notify_one();
            return Ok(DispatchStatus::Handled);
        }
        if reroute {
            debug!("Callee saturated, asking dealer to reroute invocation {request}");
            call.session
                .send(error_for(
                    Message::INVOCATION_TAG,
                    request,
                    &InteractionError::Unavailable.into(),
                ))
                .await?;
            return Ok(DispatchStatus::Handled);
        }
        debug!("Callee saturated, invocation {request} is busy");
        Ok(DispatchStatus::Busy)
    }

    /// Interrupts a call. The call is dropped without a reply.
    ///
    /// Returns false if the call does not exist, which happens when it already finished.
    pub async fn interrupt(&self, session: &Session, request: Id) -> bool {
        let call = self.calls.lock().await.remove(&(session.uuid(), request));
        let call = match call {
            Some(call) => call,
            None => return false,
        };
        if let CallState::Running(future) = &call.state {
            future.cancel(true);
        }
        call.finish(CallOutcome::Canceled);
        self.wake.notify_one();
        true
    }

    /// Drops every call of a session.
    pub async fn done(&self, session: &Session) {
        let calls = {
            let mut calls = self.calls.lock().await;
            let keys = calls
                .keys()
                .filter(|(uuid, _)| *uuid == session.uuid())
                .cloned()
                .collect::<Vec<_>>();
            keys.into_iter()
                .filter_map(|key| calls.remove(&key))
                .collect::<Vec<_>>()
        };
        for call in calls {
            if let CallState::Running(future) = &call.state {
                future.cancel(true);
            }
            call.finish(CallOutcome::Canceled);
        }
    }

    /// Advances every call once.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut replies = Vec::new();
        let mut finished = Vec::new();
        {
            let mut calls = self.calls.lock().await;
            let keys = calls.keys().cloned().collect::<Vec<_>>();
            for key in keys {
                let call = match calls.get_mut(&key) {
                    Some(call) => call,
                    None => continue,
                };
                // Anything the handler reported before finishing is read after observing the
                // finish, so progressive results always precede the final result.
                let done = match &call.state {
                    CallState::Running(future) => future.is_done(),
                    _ => false,
                };
                call.drain_progress(&mut replies);

                let cancelled = match &call.state {
                    CallState::Running(future) => future.is_cancelled(),
                    _ => false,
                };
                let expired = !done
                    && !cancelled
                    && call.deadline.is_some_and(|deadline| deadline <= now);
                if expired {
                    if let CallState::Running(future) = &call.state {
                        debug!("Invocation {} timed out", call.request);
                        future.cancel(true);
                        call.timed_out = true;
                        self.wake.notify_one();
                        continue;
                    }
                }
                let unassigned = matches!(call.state, CallState::Unassigned);
                if !(done || expired || cancelled || unassigned) {
                    continue;
                }

                let call = match calls.remove(&key) {
                    Some(call) => call,
                    None => continue,
                };
                if cancelled {
                    let (outcome, error) = if call.timed_out {
                        (CallOutcome::TimedOut, InvocationError::Timeout)
                    } else {
                        (CallOutcome::Canceled, InvocationError::Canceled)
                    };
                    call.finish(outcome);
                    replies.push((call.session.clone(), invocation_error(call.request, error)));
                } else if unassigned {
                    call.finish(CallOutcome::Error);
                    replies.push((
                        call.session.clone(),
                        invocation_error(call.request, InvocationError::NoExecutor),
                    ));
                } else if expired {
                    debug!("Delayed invocation {} timed out", call.request);
                    call.finish(CallOutcome::TimedOut);
                    replies.push((
                        call.session.clone(),
                        invocation_error(call.request, InvocationError::Timeout),
                    ));
                } else {
                    let mut call = call;
                    match std::mem::replace(&mut call.state, CallState::Unassigned) {
                        CallState::Running(future) => finished.push(FinishedCall { call, future }),
                        _ => continue,
                    }
                }
            }

            let mut running = calls.values().filter(|call| call.is_running()).count();
            let mut delayed = calls
                .iter()
                .filter(|(_, call)| matches!(call.state, CallState::Delayed(..)))
                .map(|(key, call)| (call.admitted, *key))
                .collect::<Vec<_>>();
            delayed.sort();
            for (_, key) in delayed {
                if running >= self.config.max_concurrent_tasks {
                    break;
                }
                let call = match calls.get_mut(&key) {
                    Some(call) => call,
                    None => continue,
                };
                if let CallState::Delayed(handler, invocation) =
                    std::mem::replace(&mut call.state, CallState::Unassigned)
                {
                    call.state = self.start_call(handler, invocation);
                    running += 1;
                }
            }
        }

        for (session, message) in replies {
            Self::reply(&session, message).await;
        }
        for FinishedCall { call, future } in finished {
            let message = match future.get().await {
                Ok(result) => {
                    call.finish(CallOutcome::Success);
                    yield_message(call.request, result, false)
                }
                Err(err) => {
                    let outcome = match err.downcast_ref::<InvocationError>() {
                        Some(InvocationError::Canceled) => CallOutcome::Canceled,
                        Some(InvocationError::Timeout) => CallOutcome::TimedOut,
                        _ => CallOutcome::Error,
                    };
                    call.finish(outcome);
                    error_with_trace_for(Message::INVOCATION_TAG, call.request, &err)
                }
            };
            Self::reply(&call.session, message).await;
        }
    }

    async fn reply(session: &Arc<Session>, message: Message) {
        if let Err(err) = session.send(message).await {
            warn!(
                "Failed to answer invocation for session {}: {err:#}",
                session.name()
            );
        }
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        if let Ok(mut sweep_handle) = self.sweep_handle.lock() {
            if let Some(handle) = sweep_handle.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod call_manager_test {
    use std::{
        sync::{
            Arc,
            atomic::{
                AtomicBool,
                Ordering,
            },
        },
        time::Duration,
    };

    use futures_util::lock::Mutex;

    use crate::{
        core::{
            features::{
                Feature,
                FeatureSet,
            },
            hash::HashMap,
            id::Id,
            options::InvocationDetails,
            roles::Role,
            uri::Uri,
        },
        dispatch::flow::DispatchStatus,
        message::message::Message,
        peer::callee::{
            call_manager::{
                CallManager,
                PendingCall,
            },
            callee::CalleeConfig,
            executor::{
                Executor,
                TokioExecutor,
            },
            invocation::{
                Invocation,
                ProcedureHandler,
                RpcYield,
            },
        },
        realm::realm::{
            Realm,
            RealmConfig,
            RealmManager,
        },
        session::{
            party::Party,
            session::{
                Session,
                SessionConfig,
            },
        },
        stats::statistics::ProcedureStatistics,
        transport::{
            direct::direct_transport_pair,
            transport::Transport,
        },
    };

    async fn established_session(features: &[Feature]) -> (Arc<Session>, Arc<dyn Transport>) {
        let (local, remote) = direct_transport_pair("callee");
        let session = Arc::new(Session::new(
            SessionConfig {
                name: "callee".to_owned(),
                ..Default::default()
            },
            Arc::new(local),
            Arc::new(RealmManager::default()),
        ));
        let realm = Arc::new(Realm::new(RealmConfig {
            name: "test".to_owned(),
            uri: Uri::try_from("com.example.test").unwrap(),
        }));
        let features = FeatureSet::from_iter(features.iter().cloned());
        session
            .establish(
                Id::MIN,
                realm,
                Party {
                    roles: HashMap::from_iter([(Role::Callee, features.clone())]),
                    ..Default::default()
                },
                Party {
                    roles: HashMap::from_iter([(Role::Dealer, features)]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (session, Arc::new(remote))
    }

    fn sleeper() -> Arc<dyn ProcedureHandler> {
        Arc::new(|_: Invocation| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, anyhow::Error>(RpcYield::default())
        })
    }

    fn recorder(order: Arc<Mutex<Vec<Id>>>) -> Arc<dyn ProcedureHandler> {
        Arc::new(move |invocation: Invocation| {
            let order = order.clone();
            async move {
                order.lock().await.push(invocation.request);
                Ok::<_, anyhow::Error>(RpcYield::default())
            }
        })
    }

    fn pending_call(
        session: &Arc<Session>,
        request: u64,
        handler: Arc<dyn ProcedureHandler>,
        details: InvocationDetails,
        canceled: Arc<AtomicBool>,
    ) -> PendingCall {
        PendingCall {
            session: session.clone(),
            handler,
            invocation: Invocation {
                procedure: Uri::try_from("com.example.procedure").unwrap(),
                registration: Id::MIN,
                request: Id::try_from(request).unwrap(),
                arguments: Default::default(),
                arguments_keyword: Default::default(),
                details,
                progress_tx: None,
                canceled,
            },
            progress_rx: None,
            statistics: Arc::new(ProcedureStatistics::default()),
        }
    }

    fn simple_call(
        session: &Arc<Session>,
        request: u64,
        handler: Arc<dyn ProcedureHandler>,
    ) -> PendingCall {
        pending_call(
            session,
            request,
            handler,
            InvocationDetails::default(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    async fn next_reply(remote: &Arc<dyn Transport>, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, remote.receive())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn refused_call_is_answered_with_no_executor() {
        let executor = Arc::new(TokioExecutor::default());
        executor.shut_down();
        let manager = CallManager::new(CalleeConfig::default(), executor);
        let (session, remote) = established_session(&[]).await;

        let call = simple_call(&session, 1, sleeper());
        let statistics = call.statistics.clone();
        assert_matches::assert_matches!(manager.admit(call).await, Ok(DispatchStatus::Handled));
        pretty_assertions::assert_eq!(manager.call_count().await, 1);
        pretty_assertions::assert_eq!(manager.running_count().await, 0);

        manager.sweep().await;
        assert_matches::assert_matches!(next_reply(&remote, Duration::from_secs(1)).await, Some(Message::Error(message)) => {
            pretty_assertions::assert_eq!(message.request_type, Message::INVOCATION_TAG);
            pretty_assertions::assert_eq!(message.request, Id::try_from(1).unwrap());
            pretty_assertions::assert_eq!(message.error.as_ref(), "no_executor.invocation.error");
        });
        pretty_assertions::assert_eq!(manager.call_count().await, 0);
        pretty_assertions::assert_eq!(statistics.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn interrupted_delayed_call_is_dropped_without_reply() {
        let manager = CallManager::new(
            CalleeConfig {
                max_concurrent_tasks: 1,
                ..Default::default()
            },
            Arc::new(TokioExecutor::default()),
        );
        let (session, remote) = established_session(&[]).await;

        assert_matches::assert_matches!(
            manager.admit(simple_call(&session, 1, sleeper())).await,
            Ok(DispatchStatus::Handled)
        );
        let delayed = simple_call(&session, 2, sleeper());
        let statistics = delayed.statistics.clone();
        assert_matches::assert_matches!(manager.admit(delayed).await, Ok(DispatchStatus::Handled));
        pretty_assertions::assert_eq!(manager.call_count().await, 2);
        pretty_assertions::assert_eq!(manager.running_count().await, 1);

        assert!(manager.interrupt(&session, Id::try_from(2).unwrap()).await);
        assert!(!manager.interrupt(&session, Id::try_from(2).unwrap()).await);
        pretty_assertions::assert_eq!(manager.call_count().await, 1);
        pretty_assertions::assert_eq!(manager.running_count().await, 1);
        pretty_assertions::assert_eq!(statistics.snapshot().cancels, 1);

        manager.sweep().await;
        assert_matches::assert_matches!(next_reply(&remote, Duration::from_millis(50)).await, None);

        manager.stop().await;
        pretty_assertions::assert_eq!(manager.call_count().await, 0);
    }

    #[tokio::test]
    async fn delayed_calls_start_in_admission_order() {
        let manager = CallManager::new(
            CalleeConfig {
                max_concurrent_tasks: 1,
                ..Default::default()
            },
            Arc::new(TokioExecutor::default()),
        );
        let (session, remote) = established_session(&[]).await;
        let order = Arc::new(Mutex::new(Vec::new()));

        for request in 1..=3u64 {
            assert_matches::assert_matches!(
                manager
                    .admit(simple_call(&session, request, recorder(order.clone())))
                    .await,
                Ok(DispatchStatus::Handled)
            );
        }
        pretty_assertions::assert_eq!(manager.running_count().await, 1);

        for _ in 0..200 {
            manager.sweep().await;
            if manager.call_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pretty_assertions::assert_eq!(manager.call_count().await, 0);

        let expected = (1..=3u64)
            .map(|request| Id::try_from(request).unwrap())
            .collect::<Vec<_>>();
        pretty_assertions::assert_eq!(*order.lock().await, expected);
        for request in expected {
            assert_matches::assert_matches!(next_reply(&remote, Duration::from_secs(1)).await, Some(Message::Yield(message)) => {
                pretty_assertions::assert_eq!(message.invocation_request, request);
            });
        }
    }

    #[tokio::test]
    async fn externally_canceled_call_is_answered_with_canceled() {
        let manager = CallManager::new(CalleeConfig::default(), Arc::new(TokioExecutor::default()));
        let (session, remote) = established_session(&[]).await;

        let canceled = Arc::new(AtomicBool::new(false));
        let call = pending_call(
            &session,
            1,
            sleeper(),
            InvocationDetails::default(),
            canceled.clone(),
        );
        let statistics = call.statistics.clone();
        assert_matches::assert_matches!(manager.admit(call).await, Ok(DispatchStatus::Handled));

        canceled.store(true, Ordering::Release);
        manager.sweep().await;
        assert_matches::assert_matches!(next_reply(&remote, Duration::from_secs(1)).await, Some(Message::Error(message)) => {
            pretty_assertions::assert_eq!(message.error.as_ref(), "cancelled.invocation.error");
        });
        pretty_assertions::assert_eq!(manager.call_count().await, 0);
        pretty_assertions::assert_eq!(statistics.snapshot().cancels, 1);
    }

    #[tokio::test]
    async fn timed_out_call_is_canceled_then_answered() {
        let manager = CallManager::new(CalleeConfig::default(), Arc::new(TokioExecutor::default()));
        let (session, remote) = established_session(&[Feature::CallTimeout]).await;

        let canceled = Arc::new(AtomicBool::new(false));
        let call = pending_call(
            &session,
            1,
            sleeper(),
            InvocationDetails {
                timeout: Some(Duration::from_millis(10)),
                ..Default::default()
            },
            canceled.clone(),
        );
        let statistics = call.statistics.clone();
        assert_matches::assert_matches!(manager.admit(call).await, Ok(DispatchStatus::Handled));
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.sweep().await;
        assert!(canceled.load(Ordering::Acquire));
        pretty_assertions::assert_eq!(manager.call_count().await, 1);
        assert_matches::assert_matches!(next_reply(&remote, Duration::from_millis(50)).await, None);

        manager.sweep().await;
        assert_matches::assert_matches!(next_reply(&remote, Duration::from_secs(1)).await, Some(Message::Error(message)) => {
            pretty_assertions::assert_eq!(message.error.as_ref(), "timeout.invocation.error");
        });
        pretty_assertions::assert_eq!(manager.call_count().await, 0);
        pretty_assertions::assert_eq!(statistics.snapshot().timeouts, 1);
        pretty_assertions::assert_eq!(statistics.snapshot().cancels, 0);
    }

    #[tokio::test]
    async fn timeout_without_negotiation_is_not_enforced() {
        let manager = CallManager::new(CalleeConfig::default(), Arc::new(TokioExecutor::default()));
        let (session, remote) = established_session(&[]).await;

        let canceled = Arc::new(AtomicBool::new(false));
        assert_matches::assert_matches!(
            manager
                .admit(pending_call(
                    &session,
                    1,
                    sleeper(),
                    InvocationDetails {
                        timeout: Some(Duration::from_millis(10)),
                        ..Default::default()
                    },
                    canceled.clone(),
                ))
                .await,
            Ok(DispatchStatus::Handled)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.sweep().await;
        manager.sweep().await;
        assert!(!canceled.load(Ordering::Acquire));
        pretty_assertions::assert_eq!(manager.running_count().await, 1);
        assert_matches::assert_matches!(next_reply(&remote, Duration::from_millis(50)).await, None);
        manager.stop().await;
    }
}
