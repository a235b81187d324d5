//! A controller that releases once enough jobs are accounted for.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Barrier, BarrierController, BarrierId, Registration};
use crate::dispatch::Dispatcher;
use crate::errors::{BarrierError, BoxError, PanicError};
use crate::events::{EventSink, NoOpEventSink};
use crate::utils::SortReplayer;

/// Batch transform applied to every input that arrived at a counted barrier.
///
/// Receives the inputs sorted by their natural order and must return one
/// output per input, in the same order.
#[async_trait]
pub trait Aggregator<T: Send + 'static>: Send + Sync {
    /// Transforms the sorted batch.
    async fn aggregate(&self, inputs: Vec<T>) -> Result<Vec<T>, BoxError>;
}

/// An async function-based aggregator.
pub struct FnAggregator<F> {
    func: F,
}

impl<F> FnAggregator<F> {
    /// Creates a new function-based aggregator.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnAggregator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAggregator").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F, Fut> Aggregator<T> for FnAggregator<F>
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<T>, BoxError>> + Send + 'static,
{
    async fn aggregate(&self, inputs: Vec<T>) -> Result<Vec<T>, BoxError> {
        (self.func)(inputs).await
    }
}

struct CountedState<T> {
    capacity: usize,
    /// Never decremented; bounds every later capacity change.
    registered_count: usize,
    arrival_count: usize,
    absentee_count: usize,
    registrations: HashMap<BarrierId, Registration<T>>,
    interrupted: bool,
    releasing: bool,
}

impl<T> CountedState<T> {
    fn is_ready(&self) -> bool {
        !self.releasing && self.arrival_count.saturating_add(self.absentee_count) == self.capacity
    }
}

/// Everything a release needs, captured under the controller lock.
struct Release<T> {
    arrived: Vec<Arc<Barrier<T>>>,
    inputs: Vec<T>,
}

/// Releases its barriers once `arrivals + absentees == capacity`.
///
/// Jobs that failed upstream are reported with
/// [`notify_error`](Self::notify_error) so the remaining jobs do not wait
/// for them. The release runs on a task spawned through the dispatcher.
/// When an [`Aggregator`] is configured it is called once with every
/// arrived input, and each job resumes with the output matching its own
/// input. An aggregation failure fails every arrived job and resets the
/// controller so their retries can arrive again.
///
/// Interrupting any registered barrier before the release interrupts all
/// of its siblings, as well as every barrier registered afterwards.
pub struct CountedBarrierController<T: Send + 'static> {
    name: String,
    dispatcher: Arc<dyn Dispatcher>,
    aggregator: Option<Arc<dyn Aggregator<T>>>,
    events: Arc<dyn EventSink>,
    state: Arc<Mutex<CountedState<T>>>,
}

impl<T> CountedBarrierController<T>
where
    T: Ord + Hash + Clone + Send + Sync + 'static,
{
    /// Creates a controller with unbounded capacity and no aggregator.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            name: "counted-barrier".to_string(),
            dispatcher,
            aggregator: None,
            events: Arc::new(NoOpEventSink),
            state: Arc::new(Mutex::new(CountedState {
                capacity: usize::MAX,
                registered_count: 0,
                arrival_count: 0,
                absentee_count: 0,
                registrations: HashMap::new(),
                interrupted: false,
                releasing: false,
            })),
        }
    }

    /// Sets the name used in logs and events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the initial capacity.
    #[must_use]
    pub fn with_capacity(self, capacity: usize) -> Self {
        self.state.lock().capacity = capacity;
        self
    }

    /// Sets the batch transform applied on release.
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: impl Aggregator<T> + 'static) -> Self {
        self.aggregator = Some(Arc::new(aggregator));
        self
    }

    /// Sets the sink receiving release events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the controller name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current capacity.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Changes the capacity, releasing if it is now met.
    ///
    /// # Panics
    ///
    /// Panics if more barriers than `capacity` are already registered.
    pub fn set_capacity(&self, capacity: usize) {
        let release = {
            let mut state = self.state.lock();
            assert!(
                capacity >= state.registered_count,
                "cannot change the capacity of '{}' from {} to {}: {} barriers are already registered",
                self.name,
                state.capacity,
                capacity,
                state.registered_count
            );
            state.capacity = capacity;
            self.prepare_release(&mut state)
        };
        self.dispatch(release);
    }

    /// Number of jobs reported as never going to arrive.
    pub fn error_count(&self) -> usize {
        self.state.lock().absentee_count
    }

    /// Number of jobs currently waiting.
    pub fn arrival_count(&self) -> usize {
        self.state.lock().arrival_count
    }

    /// Number of barriers ever registered.
    pub fn registered_count(&self) -> usize {
        self.state.lock().registered_count
    }

    /// Returns true once an interruption has cascaded through the controller.
    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    /// Reports a job that failed before reaching this barrier.
    pub fn notify_error(&self) {
        let release = {
            let mut state = self.state.lock();
            state.absentee_count += 1;
            debug!(controller = %self.name, absentees = state.absentee_count, "Absentee reported");
            self.prepare_release(&mut state)
        };
        self.dispatch(release);
    }

    fn prepare_release(&self, state: &mut CountedState<T>) -> Option<Release<T>> {
        if !state.is_ready() {
            return None;
        }
        state.releasing = true;

        let mut arrived = Vec::with_capacity(state.arrival_count);
        let mut inputs = Vec::with_capacity(state.arrival_count);
        for registration in state.registrations.values().filter(|r| r.blocked) {
            let Some(barrier) = registration.barrier.upgrade() else {
                continue;
            };
            let Some(input) = barrier.input() else {
                continue;
            };
            arrived.push(barrier);
            inputs.push(input);
        }

        let absent = state.registrations.len() - arrived.len();
        if absent != state.absentee_count {
            warn!(
                controller = %self.name,
                expected = state.absentee_count,
                actual = absent,
                "Absentee count does not match the barriers that never arrived"
            );
        }

        Some(Release { arrived, inputs })
    }

    fn dispatch(&self, release: Option<Release<T>>) {
        let Some(release) = release else {
            return;
        };
        info!(controller = %self.name, arrived = release.arrived.len(), "Releasing counted barrier");

        let task = ReleaseTask {
            name: self.name.clone(),
            aggregator: self.aggregator.clone(),
            events: Arc::clone(&self.events),
            state: Arc::clone(&self.state),
        };
        self.dispatcher.spawn(Box::pin(task.run(release)));
    }
}

struct ReleaseTask<T: Send + 'static> {
    name: String,
    aggregator: Option<Arc<dyn Aggregator<T>>>,
    events: Arc<dyn EventSink>,
    state: Arc<Mutex<CountedState<T>>>,
}

impl<T> ReleaseTask<T>
where
    T: Ord + Hash + Clone + Send + Sync + 'static,
{
    async fn run(self, release: Release<T>) {
        let Release { arrived, inputs } = release;

        let outputs = match (&self.aggregator, arrived.is_empty()) {
            (Some(aggregator), false) => aggregate(aggregator.as_ref(), inputs).await.map(Some),
            _ => Ok(None),
        };

        match outputs {
            Ok(outputs) => {
                self.state.lock().registrations.clear();
                self.events.try_emit(
                    "barrier.released",
                    Some(serde_json::json!({
                        "controller": self.name,
                        "arrived": arrived.len(),
                    })),
                );

                match outputs {
                    Some(outputs) => {
                        for (barrier, output) in arrived.iter().zip(outputs) {
                            barrier.lift(Some(output));
                        }
                    }
                    None => {
                        for barrier in &arrived {
                            barrier.lift(None);
                        }
                    }
                }
            }
            Err(error) => {
                {
                    let mut state = self.state.lock();
                    state.arrival_count = 0;
                    state.absentee_count = 0;
                    state.releasing = false;
                    for registration in state.registrations.values_mut() {
                        registration.blocked = false;
                    }
                }

                warn!(controller = %self.name, error = %error, "Counted barrier release failed");
                self.events.try_emit(
                    "barrier.release_failed",
                    Some(serde_json::json!({
                        "controller": self.name,
                        "arrived": arrived.len(),
                        "error": error.to_string(),
                    })),
                );

                for barrier in &arrived {
                    barrier.mark_as_failed(error.clone());
                }
            }
        }
    }
}

/// Runs the aggregator over the sorted inputs and realigns its outputs
/// with `inputs`.
async fn aggregate<T>(aggregator: &dyn Aggregator<T>, inputs: Vec<T>) -> Result<Vec<T>, BarrierError>
where
    T: Ord + Hash + Clone + Send + Sync + 'static,
{
    let mut sorted = inputs.clone();
    sorted.sort();
    let replayer = SortReplayer::new(&inputs, &sorted);
    let expected = inputs.len();
    drop(inputs);

    let outputs = match AssertUnwindSafe(aggregator.aggregate(sorted)).catch_unwind().await {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(err)) => return Err(BarrierError::aggregation_failed(err)),
        Err(payload) => {
            return Err(BarrierError::aggregation_failed(Box::new(
                PanicError::from_payload(payload.as_ref()),
            )))
        }
    };

    if outputs.len() != expected {
        return Err(BarrierError::SizeMismatch {
            expected,
            actual: outputs.len(),
        });
    }
    Ok(replayer.reverse_apply_sort_transformations(outputs))
}

impl<T> BarrierController<T> for CountedBarrierController<T>
where
    T: Ord + Hash + Clone + Send + Sync + 'static,
{
    fn on_barrier_created(&self, barrier: &Arc<Barrier<T>>) {
        let interrupt_now = {
            let mut state = self.state.lock();
            assert!(
                !state.registrations.contains_key(&barrier.id()),
                "{} cannot be registered twice",
                barrier.id()
            );
            if state.interrupted {
                true
            } else {
                assert!(
                    state.registered_count < state.capacity,
                    "'{}' has reached its capacity of {}, but another barrier was registered",
                    self.name,
                    state.capacity
                );
                state.registered_count += 1;
                state.registrations.insert(barrier.id(), Registration::new(barrier));
                false
            }
        };

        if interrupt_now {
            debug!(controller = %self.name, barrier = %barrier.id(), "Interrupting barrier created after interruption");
            barrier.interrupt();
        }
    }

    fn on_barrier_blocked(&self, barrier: &Barrier<T>) {
        let release = {
            let mut state = self.state.lock();
            let interrupted = state.interrupted;
            match state.registrations.get_mut(&barrier.id()) {
                Some(registration) => {
                    assert!(!registration.blocked, "{} cannot be marked blocked twice", barrier.id());
                    registration.blocked = true;
                }
                None => {
                    assert!(
                        interrupted,
                        "{} was never registered with '{}'",
                        barrier.id(),
                        self.name
                    );
                    return;
                }
            }
            state.arrival_count += 1;
            debug!(
                controller = %self.name,
                barrier = %barrier.id(),
                arrivals = state.arrival_count,
                capacity = state.capacity,
                "Barrier arrived"
            );
            self.prepare_release(&mut state)
        };
        self.dispatch(release);
    }

    fn on_barrier_interrupted(&self, barrier: &Barrier<T>) {
        let siblings: Vec<_> = {
            let mut state = self.state.lock();
            if state.releasing {
                debug!(controller = %self.name, barrier = %barrier.id(), "Release in flight, ignoring interruption");
                return;
            }
            if state.registrations.remove(&barrier.id()).is_none() {
                assert!(
                    state.interrupted,
                    "{} was never registered with '{}'",
                    barrier.id(),
                    self.name
                );
                return;
            }
            state.interrupted = true;
            state
                .registrations
                .drain()
                .filter_map(|(_, r)| r.barrier.upgrade())
                .collect()
        };

        info!(controller = %self.name, siblings = siblings.len(), "Cascading barrier interruption");
        for sibling in siblings {
            sibling.interrupt();
        }
    }
}

impl<T: Send + 'static> fmt::Debug for CountedBarrierController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CountedBarrierController")
            .field("name", &self.name)
            .field("capacity", &state.capacity)
            .field("registered", &state.registered_count)
            .field("arrivals", &state.arrival_count)
            .field("absentees", &state.absentee_count)
            .field("interrupted", &state.interrupted)
            .finish_non_exhaustive()
    }
}
