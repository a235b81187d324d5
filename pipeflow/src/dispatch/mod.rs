//! Execution context for orchestrators and barrier releases.
//!
//! The engine never spawns tasks directly; it goes through a [`Dispatcher`]
//! so hosts can choose the runtime and observe otherwise-unhandled panics.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::error;

use crate::errors::PanicError;

/// Callback receiving panics that escaped a dispatched task.
pub type UnhandledErrorHook = Arc<dyn Fn(&PanicError) + Send + Sync>;

/// Spawns detached tasks.
pub trait Dispatcher: Send + Sync + fmt::Debug {
    /// Runs `task` to completion in the background.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Reports a panic that escaped a dispatched task.
    fn on_internal_error(&self, error: &PanicError);
}

/// A [`Dispatcher`] backed by a tokio runtime.
#[derive(Clone)]
pub struct TokioDispatcher {
    handle: Handle,
    hook: UnhandledErrorHook,
}

impl TokioDispatcher {
    /// Creates a dispatcher spawning onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            hook: Arc::new(|err: &PanicError| {
                error!(error = %err, "Unhandled panic in dispatched task");
            }),
        }
    }

    /// Creates a dispatcher for the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Replaces the hook that receives panics from dispatched tasks.
    #[must_use]
    pub fn with_error_hook(mut self, hook: impl Fn(&PanicError) + Send + Sync + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }
}

impl fmt::Debug for TokioDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioDispatcher")
            .field("runtime", &self.handle.runtime_flavor())
            .finish_non_exhaustive()
    }
}

impl Dispatcher for TokioDispatcher {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        let dispatcher = self.clone();
        self.handle.spawn(async move {
            if let Err(payload) = AssertUnwindSafe(task).catch_unwind().await {
                dispatcher.on_internal_error(&PanicError::from_payload(payload.as_ref()));
            }
        });
    }

    fn on_internal_error(&self, error: &PanicError) {
        (self.hook)(error);
    }
}
