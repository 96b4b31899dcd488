use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;
use log::warn;
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded_channel,
};
use uuid::Uuid;

use crate::{
    core::{
        cancel::CallCancelMode,
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
        options::CallOptions,
        roles::Role,
        types::{
            Dictionary,
            List,
            Value,
            flag,
        },
        uri::Uri,
    },
    message::message::{
        CallMessage,
        CancelMessage,
        ErrorMessage,
        Message,
        ResultMessage,
    },
    peer::canceled_error,
    realm::actor::{
        Actor,
        Caller,
    },
    session::session::Session,
};

/// A call to a procedure.
#[derive(Debug, Default, Clone)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// How long the callee may run before the call is canceled.
    pub timeout: Option<Duration>,
}

/// A result of a call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// The result is progressive, so more results follow.
    pub progress: bool,
}

type ResultSender = UnboundedSender<ChannelTransmittableResult<RpcResult>>;
type ResultReceiver = UnboundedReceiver<ChannelTransmittableResult<RpcResult>>;

async fn cancel_call(session: &Arc<Session>, request: Id, mode: CallCancelMode) -> Result<()> {
    if !session
        .supports(Role::Caller, Role::Dealer, Feature::CallCanceling)
        .await
    {
        return Err(BasicError::NotAllowed(
            "call canceling is not supported on the session".to_owned(),
        )
        .into());
    }
    session
        .send(Message::Cancel(CancelMessage {
            call_request: request,
            options: Dictionary::from_iter([(
                "mode".to_owned(),
                Value::from(Into::<&'static str>::into(mode)),
            )]),
        }))
        .await
}

/// A pending call that produces a single result.
#[derive(Debug)]
pub struct SimplePendingRpc {
    session: Arc<Session>,
    request: Id,
    rx: ResultReceiver,
}

impl SimplePendingRpc {
    /// The request ID of the call.
    pub fn request(&self) -> Id {
        self.request
    }

    /// Waits for the result of the call.
    pub async fn result(mut self) -> Result<RpcResult> {
        match self.rx.recv().await {
            Some(result) => result.map_err(|err| err.into_error()),
            None => Err(InteractionError::Canceled.into()),
        }
    }

    /// Cancels the call. The result of the call reports the cancellation.
    pub async fn cancel(&self, mode: CallCancelMode) -> Result<()> {
        cancel_call(&self.session, self.request, mode).await
    }
}

/// A pending call that produces progressive results before its final result.
#[derive(Debug)]
pub struct ProgressivePendingRpc {
    session: Arc<Session>,
    request: Id,
    rx: ResultReceiver,
    done: bool,
}

impl ProgressivePendingRpc {
    /// The request ID of the call.
    pub fn request(&self) -> Id {
        self.request
    }

    /// Waits for the next result of the call.
    ///
    /// Returns [`None`] after the final result has been returned.
    pub async fn next_result(&mut self) -> Result<Option<RpcResult>> {
        if self.done {
            return Ok(None);
        }
        let result = match self.rx.recv().await {
            Some(result) => result.map_err(|err| err.into_error()),
            None => Err(InteractionError::Canceled.into()),
        };
        match &result {
            Ok(result) if result.progress => (),
            _ => self.done = true,
        }
        result.map(Some)
    }

    /// Cancels the call. The next result of the call reports the cancellation.
    pub async fn cancel(&self, mode: CallCancelMode) -> Result<()> {
        cancel_call(&self.session, self.request, mode).await
    }
}

/// The peer's caller, which correlates results with calls.
#[derive(Default)]
pub struct PeerCaller {
    pending: Mutex<HashMap<(Uuid, Id), ResultSender>>,
}

impl PeerCaller {
    async fn start_call(
        &self,
        session: &Arc<Session>,
        procedure: Uri,
        call: RpcCall,
        receive_progress: bool,
    ) -> Result<(Id, ResultReceiver)> {
        let request = session.next_request_id();
        let options = CallOptions {
            timeout: call.timeout,
            receive_progress,
        };
        let (tx, rx) = unbounded_channel();
        self.pending
            .lock()
            .await
            .insert((session.uuid(), request), tx);
        if let Err(err) = session
            .send_request(Message::Call(CallMessage {
                request,
                options: options.to_dictionary(),
                procedure,
                arguments: call.arguments,
                arguments_keyword: call.arguments_keyword,
            }))
            .await
        {
            self.pending.lock().await.remove(&(session.uuid(), request));
            return Err(err);
        }
        Ok((request, rx))
    }

    /// Calls a procedure.
    pub async fn call(
        &self,
        session: &Arc<Session>,
        procedure: Uri,
        call: RpcCall,
    ) -> Result<SimplePendingRpc> {
        let (request, rx) = self.start_call(session, procedure, call, false).await?;
        Ok(SimplePendingRpc {
            session: session.clone(),
            request,
            rx,
        })
    }

    /// Calls a procedure, accepting progressive results.
    pub async fn call_with_progress(
        &self,
        session: &Arc<Session>,
        procedure: Uri,
        call: RpcCall,
    ) -> Result<ProgressivePendingRpc> {
        if !session
            .supports(Role::Caller, Role::Dealer, Feature::ProgressiveCallResults)
            .await
        {
            return Err(BasicError::NotAllowed(
                "progressive call results are not supported on the session".to_owned(),
            )
            .into());
        }
        let (request, rx) = self.start_call(session, procedure, call, true).await?;
        Ok(ProgressivePendingRpc {
            session: session.clone(),
            request,
            rx,
            done: false,
        })
    }
}

#[async_trait]
impl Actor for PeerCaller {
    fn supported_features(&self) -> FeatureSet {
        FeatureSet::from_iter([
            Feature::ProgressiveCallResults,
            Feature::CallTimeout,
            Feature::CallCanceling,
            Feature::CallerIdentification,
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
impl Caller for PeerCaller {
    async fn handle_result(&self, session: &Arc<Session>, message: &ResultMessage) -> Result<()> {
        let progress = flag(&message.details, "progress");
        let key = (session.uuid(), message.call_request);
        let tx = {
            let mut pending = self.pending.lock().await;
            if progress {
                pending.get(&key).cloned()
            } else {
                pending.remove(&key)
            }
        };
        let tx = match tx {
            Some(tx) => tx,
            None => {
                warn!(
                    "Session {} received RESULT for unknown call {}",
                    session.name(),
                    message.call_request
                );
                return Ok(());
            }
        };
        tx.send(Ok(RpcResult {
            arguments: message.yield_arguments.clone(),
            arguments_keyword: message.yield_arguments_keyword.clone(),
            progress,
        }))
        .ok();
        Ok(())
    }

    async fn handle_error(&self, session: &Arc<Session>, message: &ErrorMessage) -> Result<()> {
        let tx = self
            .pending
            .lock()
            .await
            .remove(&(session.uuid(), message.request));
        if let Some(tx) = tx {
            let error = ChannelTransmittableError::try_from(&Message::Error(message.clone()))?;
            tx.send(Err(error)).ok();
        }
        Ok(())
    }
}
