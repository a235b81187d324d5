//! The single-use suspension point behind every barrier step.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::BarrierController;
use crate::errors::BarrierError;
use crate::steps::{Step, StepResult};

static NEXT_BARRIER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [`Barrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarrierId(u64);

impl BarrierId {
    fn next() -> Self {
        Self(NEXT_BARRIER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "barrier-{}", self.0)
    }
}

/// Observable phase of a [`Barrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierStatus {
    /// Waiting for its first (or next, after a failure) invocation.
    Initialized,
    /// A caller is suspended inside [`Barrier::invoke`].
    Blocked,
    /// Released; callers pass through.
    Lifted,
    /// Interrupted; callers receive no result.
    Interrupted,
    /// Failed before anyone invoked it; the next invocation fails.
    Failed,
}

/// Outcome handed to the suspended caller.
type Resolution<T> = Result<Option<T>, BarrierError>;

enum Phase {
    Initialized,
    Blocked,
    Lifted,
    Interrupted,
    Failed(BarrierError),
}

struct Inner<T> {
    phase: Phase,
    input: Option<T>,
    result: Option<T>,
    waiter: Option<oneshot::Sender<Resolution<T>>>,
}

impl<T: Clone> Inner<T> {
    fn lifted_value(&mut self) -> Option<T> {
        self.result.take().or_else(|| self.input.clone())
    }

    fn reset(&mut self) {
        self.phase = Phase::Initialized;
        self.input = None;
        self.result = None;
        self.waiter = None;
    }
}

/// A rendezvous point for one job, coordinated by a shared controller.
///
/// A caller of [`invoke`](Self::invoke) is suspended without occupying its
/// thread until the controller lifts, interrupts or fails the barrier.
/// Exactly one of those wins per blocked cycle; the rest are ignored.
/// A failure resets the barrier so a retry can invoke it again.
pub struct Barrier<T> {
    id: BarrierId,
    controller: Arc<dyn BarrierController<T>>,
    inner: Mutex<Inner<T>>,
}

impl<T> Barrier<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a barrier and registers it with `controller`.
    pub fn new(controller: Arc<dyn BarrierController<T>>) -> Arc<Self> {
        let barrier = Arc::new(Self {
            id: BarrierId::next(),
            controller,
            inner: Mutex::new(Inner {
                phase: Phase::Initialized,
                input: None,
                result: None,
                waiter: None,
            }),
        });
        barrier.controller.on_barrier_created(&barrier);
        barrier
    }

    /// Returns the barrier's identifier.
    pub fn id(&self) -> BarrierId {
        self.id
    }

    /// Returns the input of the current cycle, if invoked.
    pub fn input(&self) -> Option<T> {
        self.inner.lock().input.clone()
    }

    /// Returns the current phase.
    pub fn status(&self) -> BarrierStatus {
        match self.inner.lock().phase {
            Phase::Initialized => BarrierStatus::Initialized,
            Phase::Blocked => BarrierStatus::Blocked,
            Phase::Lifted => BarrierStatus::Lifted,
            Phase::Interrupted => BarrierStatus::Interrupted,
            Phase::Failed(_) => BarrierStatus::Failed,
        }
    }

    /// Passes `input` through the barrier.
    ///
    /// Returns immediately if a result is already prepared; otherwise
    /// notifies the controller of the arrival and waits. `Ok(None)` means the
    /// barrier was interrupted.
    ///
    /// # Panics
    ///
    /// Panics if invoked twice without an intermediate failure.
    pub async fn invoke(&self, input: T) -> Result<Option<T>, BarrierError> {
        let waiting = {
            let mut inner = self.inner.lock();
            assert!(
                inner.input.is_none(),
                "{} cannot be invoked twice without an intermediate failure",
                self.id
            );
            inner.input = Some(input);

            match std::mem::replace(&mut inner.phase, Phase::Blocked) {
                Phase::Initialized => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiter = Some(tx);
                    rx
                }
                Phase::Lifted => {
                    inner.phase = Phase::Lifted;
                    return Ok(inner.lifted_value());
                }
                Phase::Interrupted => {
                    inner.phase = Phase::Interrupted;
                    return Ok(None);
                }
                Phase::Failed(err) => {
                    inner.reset();
                    return Err(err);
                }
                Phase::Blocked => {
                    panic!("{} cannot be blocked twice without an intermediate failure", self.id)
                }
            }
        };

        self.controller.on_barrier_blocked(self);
        waiting.await.unwrap_or(Ok(None))
    }

    /// Releases the barrier.
    ///
    /// The caller resumes with `result`, or with its own input when `None`.
    /// Only the first release of a cycle takes effect.
    pub fn lift(&self, result: Option<T>) {
        let resume = {
            let mut inner = self.inner.lock();
            match inner.phase {
                Phase::Initialized => {
                    inner.phase = Phase::Lifted;
                    inner.result = result;
                    return;
                }
                Phase::Blocked => {
                    inner.phase = Phase::Lifted;
                    inner.result = result;
                    let value = inner.lifted_value();
                    inner.waiter.take().map(|waiter| (waiter, value))
                }
                Phase::Lifted | Phase::Interrupted | Phase::Failed(_) => return,
            }
        };

        if let Some((waiter, value)) = resume {
            let _ = waiter.send(Ok(value));
        }
    }

    /// Interrupts the barrier and tells the controller about it.
    ///
    /// The caller resumes with no result. Only the first call takes effect.
    pub fn interrupt(&self) {
        let waiter = {
            let mut inner = self.inner.lock();
            match inner.phase {
                Phase::Initialized | Phase::Blocked => {
                    inner.phase = Phase::Interrupted;
                    inner.waiter.take()
                }
                Phase::Lifted | Phase::Interrupted | Phase::Failed(_) => return,
            }
        };

        self.controller.on_barrier_interrupted(self);
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(None));
        }
    }

    /// Fails the current cycle with `error` and resets the barrier.
    ///
    /// A suspended caller resumes with the error. If nobody has invoked the
    /// barrier yet, the next invocation fails instead.
    pub fn mark_as_failed(&self, error: BarrierError) {
        let waiter = {
            let mut inner = self.inner.lock();
            match inner.phase {
                Phase::Blocked => {
                    let waiter = inner.waiter.take();
                    inner.reset();
                    waiter
                }
                Phase::Initialized => {
                    inner.phase = Phase::Failed(error);
                    return;
                }
                Phase::Lifted | Phase::Interrupted | Phase::Failed(_) => return,
            }
        };

        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(error));
        }
    }
}

impl<T> fmt::Debug for Barrier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").field("id", &self.id).finish_non_exhaustive()
    }
}

#[async_trait]
impl<T> Step<T> for Barrier<T>
where
    T: Clone + Send + 'static,
{
    async fn run(&self, input: T) -> StepResult<T> {
        Ok(self.invoke(input).await?)
    }

    fn interrupt(&self) {
        Self::interrupt(self);
    }
}
