use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{
    error::BasicError,
    id::Id,
    options::InvocationDetails,
    types::{
        Dictionary,
        List,
    },
    uri::Uri,
};

/// A result produced by a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A single invocation of a registered procedure, handed to its handler.
#[derive(Debug)]
pub struct Invocation {
    pub procedure: Uri,
    pub registration: Id,
    pub request: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: InvocationDetails,
    pub(crate) progress_tx: Option<UnboundedSender<RpcYield>>,
    pub(crate) canceled: Arc<AtomicBool>,
}

impl Invocation {
    /// Checks if the caller accepts progressive results.
    pub fn receives_progress(&self) -> bool {
        self.progress_tx.is_some()
    }

    /// Sends a progressive result ahead of the final result.
    ///
    /// Fails if the caller does not accept progressive results.
    pub fn progress(&self, result: RpcYield) -> Result<()> {
        let progress_tx = self.progress_tx.as_ref().ok_or_else(|| {
            BasicError::NotAllowed("caller does not accept progressive results".to_owned())
        })?;
        progress_tx
            .send(result)
            .map_err(|_| BasicError::NotAllowed("invocation already finished".to_owned()).into())
    }

    /// Checks if the invocation was canceled, by the caller or by its timeout.
    ///
    /// Long-running handlers should check this between steps.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Runs invocations of a registered procedure.
#[async_trait]
pub trait ProcedureHandler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield>;
}

#[async_trait]
impl<F, Fut> ProcedureHandler for F
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RpcYield>> + Send,
{
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield> {
        self(invocation).await
    }
}
