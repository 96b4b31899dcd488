use std::sync::{
    Arc,
    atomic::{
        AtomicBool,
        Ordering,
    },
};

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::{
    core::error::InvocationError,
    peer::callee::invocation::{
        Invocation,
        ProcedureHandler,
        RpcYield,
    },
};

/// The running future of a single invocation.
#[derive(Debug)]
pub struct CallFuture {
    join_handle: JoinHandle<Result<RpcYield>>,
    canceled: Arc<AtomicBool>,
}

impl CallFuture {
    /// Wraps a spawned task. `canceled` is shared with the task's [`Invocation`].
    pub fn new(join_handle: JoinHandle<Result<RpcYield>>, canceled: Arc<AtomicBool>) -> Self {
        Self {
            join_handle,
            canceled,
        }
    }

    /// Checks if the future finished, successfully or not.
    pub fn is_done(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Checks if the future was canceled.
    pub fn is_cancelled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Cancels the future.
    ///
    /// The invocation always observes the cancellation. With `may_interrupt`, the task is also
    /// aborted at its next await point.
    pub fn cancel(&self, may_interrupt: bool) {
        self.canceled.store(true, Ordering::Release);
        if may_interrupt {
            self.join_handle.abort();
        }
    }

    /// Waits for the result of the future.
    pub async fn get(self) -> Result<RpcYield> {
        match self.join_handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(InvocationError::Canceled.into()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Runs invocations asynchronously.
pub trait Executor: Send + Sync {
    /// Starts running the invocation, returning its future immediately.
    ///
    /// Fails with [`InvocationError::NoExecutor`] if the executor can no longer run work.
    fn execute(&self, handler: Arc<dyn ProcedureHandler>, invocation: Invocation)
    -> Result<CallFuture>;

    /// Stops the executor. Running futures are not affected.
    fn shut_down(&self);
}

/// An executor that spawns every invocation onto the current Tokio runtime.
#[derive(Debug, Default)]
pub struct TokioExecutor {
    stopped: AtomicBool,
}

impl Executor for TokioExecutor {
    fn execute(
        &self,
        handler: Arc<dyn ProcedureHandler>,
        invocation: Invocation,
    ) -> Result<CallFuture> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(InvocationError::NoExecutor.into());
        }
        let canceled = invocation.canceled.clone();
        let join_handle = tokio::spawn(async move { handler.invoke(invocation).await });
        Ok(CallFuture::new(join_handle, canceled))
    }

    fn shut_down(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod executor_test {
    use std::sync::{
        Arc,
        atomic::AtomicBool,
    };

    use anyhow::Result;

    use crate::{
        core::{
            error::InvocationError,
            id::Id,
            uri::Uri,
        },
        peer::callee::{
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
    };

    fn invocation() -> Invocation {
        Invocation {
            procedure: Uri::try_from("com.example.echo").unwrap(),
            registration: Id::MIN,
            request: Id::MIN,
            arguments: Default::default(),
            arguments_keyword: Default::default(),
            details: Default::default(),
            progress_tx: None,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn sleeper() -> Arc<dyn ProcedureHandler> {
        Arc::new(|_: Invocation| async move {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok::<_, anyhow::Error>(RpcYield::default())
        })
    }

    #[tokio::test]
    async fn runs_invocations_to_completion() {
        let executor = TokioExecutor::default();
        let handler: Arc<dyn ProcedureHandler> =
            Arc::new(|invocation: Invocation| async move {
                Ok::<_, anyhow::Error>(RpcYield {
                    arguments: invocation.arguments,
                    ..Default::default()
                })
            });
        let future = executor.execute(handler, invocation()).unwrap();
        assert_matches::assert_matches!(future.get().await, Ok(_));
    }

    #[tokio::test]
    async fn interrupting_cancels_the_future() {
        let executor = TokioExecutor::default();
        let future = executor.execute(sleeper(), invocation()).unwrap();
        assert!(!future.is_cancelled());
        future.cancel(true);
        assert!(future.is_cancelled());
        let result: Result<RpcYield> = future.get().await;
        assert_matches::assert_matches!(result, Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<InvocationError>(), Some(InvocationError::Canceled));
        });
    }

    #[tokio::test]
    async fn stopped_executor_refuses_work() {
        let executor = TokioExecutor::default();
        executor.shut_down();
        assert_matches::assert_matches!(executor.execute(sleeper(), invocation()), Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<InvocationError>(), Some(InvocationError::NoExecutor));
        });
    }
}
