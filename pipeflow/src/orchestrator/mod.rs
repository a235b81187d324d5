//! Drives one job's item through its steps.
//!
//! An [`Orchestrator`] owns the job's [`State`], retries failed attempts up
//! to each step's budget, honours interruptions, and publishes every
//! transition to its listeners in order.

mod state_holder;

pub use state_holder::{StateListener, SubscriptionId};

use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::{Identifiable, State};
use crate::dispatch::{Dispatcher, TokioDispatcher};
use crate::errors::{JobError, PanicError};
use crate::events::{EventSink, NoOpEventSink};
use crate::steps::{Step, StepDescriptor};
use state_holder::StateHolder;

/// Called when a job stops for good because of a failure other than an
/// interruption, with the index of the step it stopped at.
pub type FailureCallback = Arc<dyn Fn(usize, &JobError) + Send + Sync>;

/// Why the run loop stopped before reaching the end.
enum Halt {
    Interrupted,
    Exhausted(JobError),
    Aborted(JobError),
}

struct Inner<T: Send + 'static> {
    id: Uuid,
    steps: Vec<StepDescriptor<T>>,
    input: Mutex<Option<T>>,
    started: AtomicBool,
    interrupted: AtomicBool,
    current_step: Mutex<Option<Arc<dyn Step<T>>>>,
    holder: StateHolder,
    result: Mutex<Option<T>>,
    on_failure: Option<FailureCallback>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Executes an ordered list of steps for one item.
///
/// Nothing runs until [`start`](Self::start). Clones share the same job.
pub struct Orchestrator<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for Orchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Orchestrator<T>
where
    T: Identifiable + Clone + Send + 'static,
{
    /// Starts building an orchestrator for `input`.
    pub fn builder(input: T, steps: Vec<StepDescriptor<T>>) -> OrchestratorBuilder<T> {
        OrchestratorBuilder {
            input,
            steps,
            dispatcher: None,
            events: Arc::new(NoOpEventSink),
            on_failure: None,
        }
    }

    /// Returns the job id, which is the input's id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the current state.
    pub fn state(&self) -> State {
        self.inner.holder.state()
    }

    /// Returns the final item once the job succeeded.
    pub fn result(&self) -> Option<T> {
        if !self.state().is_success() {
            return None;
        }
        self.inner.result.lock().clone()
    }

    /// Returns true once [`start`](Self::start) or a pre-start
    /// [`interrupt`](Self::interrupt) has been called.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Registers a listener for every later transition.
    pub fn subscribe(&self, listener: impl StateListener + 'static) -> SubscriptionId {
        self.inner.holder.subscribe(Arc::new(listener))
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.holder.unsubscribe(id)
    }

    /// Removes every listener.
    pub fn unsubscribe_all(&self) {
        self.inner.holder.unsubscribe_all();
    }

    /// Waits until the job reaches a terminal state and returns it.
    pub async fn wait_for_terminal(&self) -> State {
        self.inner.holder.wait_for_terminal().await
    }

    /// Begins executing the steps on the dispatcher. Later calls do nothing.
    pub fn start(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!(job_id = %self.inner.id, steps = self.inner.steps.len(), "Starting job");
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.spawn(Box::pin(inner.run()));
    }

    /// Interrupts the job.
    ///
    /// Before [`start`](Self::start) the job fails immediately without
    /// running any step. Afterwards the step in flight is asked to stop and
    /// no further step or attempt begins.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);

        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(job_id = %self.inner.id, "Job interrupted before start");
            self.inner.input.lock().take();
            let id = self.inner.id;
            let _ = self
                .inner
                .holder
                .transition(|state| state.on_failure(JobError::interrupted(id, None)));
            return;
        }

        let step = self.inner.current_step.lock().clone();
        if let Some(step) = step {
            step.interrupt();
        }
    }
}

impl<T> Identifiable for Orchestrator<T>
where
    T: Send + 'static,
{
    fn id(&self) -> Uuid {
        self.inner.id
    }
}

impl<T: Send + 'static> fmt::Debug for Orchestrator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("id", &self.inner.id)
            .field("state", &self.inner.holder.state().to_string())
            .finish_non_exhaustive()
    }
}

impl<T> Inner<T>
where
    T: Identifiable + Clone + Send + 'static,
{
    async fn run(self: Arc<Self>) {
        let Some(mut item) = self.input.lock().take() else {
            return;
        };

        if self.interrupted.load(Ordering::SeqCst) {
            let _ = self
                .holder
                .transition(|state| state.on_failure(JobError::interrupted(self.id, None)));
            return;
        }

        for (index, descriptor) in self.steps.iter().enumerate() {
            match self.run_step(descriptor, item).await {
                Ok(next) => item = next,
                Err(Halt::Interrupted) => return,
                Err(Halt::Exhausted(cause) | Halt::Aborted(cause)) => {
                    if let Some(on_failure) = &self.on_failure {
                        on_failure(index, &cause);
                    }
                    return;
                }
            }
        }

        *self.result.lock() = Some(item);
        if self.holder.transition(|state| state.on_success(None)).is_err() {
            self.result.lock().take();
        }
    }

    /// Runs one step with retries. The step stays reachable from
    /// [`Orchestrator::interrupt`] until every attempt is over, including
    /// the gaps between attempts.
    async fn run_step(&self, descriptor: &StepDescriptor<T>, item: T) -> Result<T, Halt> {
        *self.current_step.lock() = Some(Arc::clone(descriptor.step()));
        let outcome = self.attempt_step(descriptor, item).await;
        self.current_step.lock().take();
        outcome
    }

    async fn attempt_step(&self, descriptor: &StepDescriptor<T>, item: T) -> Result<T, Halt> {
        let name = descriptor.name();
        let step = descriptor.step();

        for attempt in 0..descriptor.max_attempts() {
            self.holder
                .transition(|state| state.on_success(Some(name)))
                .map_err(Halt::Aborted)?;

            if self.interrupted.load(Ordering::SeqCst) {
                // `interrupt` may have run before the step was published.
                step.interrupt();
                return Err(self.stop_interrupted(name, attempt));
            }

            let outcome = AssertUnwindSafe(step.run(item.clone())).catch_unwind().await;

            let cause = match outcome {
                Ok(Ok(Some(output))) => {
                    assert!(
                        output.id() == self.id,
                        "step '{name}' changed the identity of job {} to {}",
                        self.id,
                        output.id()
                    );
                    self.holder
                        .transition(|state| state.on_success(None))
                        .map_err(Halt::Aborted)?;
                    return Ok(output);
                }
                Ok(Ok(None)) => {
                    self.interrupted.store(true, Ordering::SeqCst);
                    return Err(self.stop_interrupted(name, attempt));
                }
                Ok(Err(err)) => JobError::step_failed(self.id, name, attempt, err),
                Err(payload) => JobError::step_failed(
                    self.id,
                    name,
                    attempt,
                    Box::new(PanicError::from_payload(payload.as_ref())),
                ),
            };

            self.holder
                .transition(|state| state.on_failure(cause))
                .map_err(Halt::Aborted)?;
        }

        let exhausted = JobError::out_of_attempts(
            self.id,
            name,
            descriptor.max_attempts(),
            self.holder.state().cause().cloned(),
        );
        let _ = self.holder.transition(|state| state.on_failure(exhausted.clone()));
        Err(Halt::Exhausted(exhausted))
    }

    /// Fails the current attempt and then the job as interrupted.
    fn stop_interrupted(&self, step: &str, attempt: u32) -> Halt {
        let failed = self
            .holder
            .transition(|state| state.on_failure(JobError::step_interrupted(self.id, step, attempt)));
        if failed.is_ok() {
            let _ = self
                .holder
                .transition(|state| state.on_failure(JobError::interrupted(self.id, state.cause().cloned())));
        }
        Halt::Interrupted
    }
}

/// Configures an [`Orchestrator`].
pub struct OrchestratorBuilder<T: Send + 'static> {
    input: T,
    steps: Vec<StepDescriptor<T>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    events: Arc<dyn EventSink>,
    on_failure: Option<FailureCallback>,
}

impl<T> OrchestratorBuilder<T>
where
    T: Identifiable + Clone + Send + 'static,
{
    /// Sets where the run loop is spawned.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Sets the sink receiving `job.state_changed` events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the callback invoked when the job fails for a reason other
    /// than an interruption.
    #[must_use]
    pub fn with_failure_callback(mut self, callback: impl Fn(usize, &JobError) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    /// Builds the orchestrator in the `Scheduled` state.
    ///
    /// # Panics
    ///
    /// Panics if no dispatcher was set and the caller is not inside a tokio
    /// runtime.
    pub fn build(self) -> Orchestrator<T> {
        let id = self.input.id();
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(TokioDispatcher::current()));
        Orchestrator {
            inner: Arc::new(Inner {
                id,
                steps: self.steps,
                input: Mutex::new(Some(self.input)),
                started: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                current_step: Mutex::new(None),
                holder: StateHolder::new(id, self.events),
                result: Mutex::new(None),
                on_failure: self.on_failure,
                dispatcher,
            }),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for OrchestratorBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}
