//! A controller released by an explicit call.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{Barrier, BarrierController, BarrierId, Registration};
use crate::dispatch::{Dispatcher, TokioDispatcher};

struct ManualState<T> {
    lifted: bool,
    pending: HashMap<BarrierId, Registration<T>>,
    /// Interrupted before arriving; dropped once the late arrival is seen.
    interrupted: HashSet<BarrierId>,
}

/// Holds every registered barrier until [`lift`](Self::lift) is called.
///
/// Lifting is one-way: barriers created afterwards pass straight through.
/// Interrupting one barrier never affects its siblings.
pub struct ManualBarrierController<T> {
    name: String,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    state: Mutex<ManualState<T>>,
}

impl<T> ManualBarrierController<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an unlifted controller.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dispatcher: None,
            state: Mutex::new(ManualState {
                lifted: false,
                pending: HashMap::new(),
                interrupted: HashSet::new(),
            }),
        }
    }

    /// Sets where [`lift_when`](Self::lift_when) pollers are spawned.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Returns the controller name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once [`lift`](Self::lift) has been called.
    pub fn is_lifted(&self) -> bool {
        self.state.lock().lifted
    }

    /// Number of registered barriers still waiting for the lift.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of pending barriers whose job has arrived.
    pub fn arrival_count(&self) -> usize {
        self.state.lock().pending.values().filter(|r| r.blocked).count()
    }

    /// Number of interrupted barriers whose job has not shown up yet.
    pub fn interrupted_count(&self) -> usize {
        self.state.lock().interrupted.len()
    }

    /// Releases every pending barrier. Later calls do nothing.
    pub fn lift(&self) {
        let released: Vec<_> = {
            let mut state = self.state.lock();
            if state.lifted {
                return;
            }
            state.lifted = true;
            state.interrupted.clear();
            state.pending.drain().map(|(_, r)| r.barrier).collect()
        };

        info!(controller = %self.name, barriers = released.len(), "Manual barrier lifted");
        for barrier in released.iter().filter_map(std::sync::Weak::upgrade) {
            barrier.lift(None);
        }
    }

    /// Polls `condition` every `period` and lifts the controller once it
    /// holds.
    ///
    /// The poller runs on the controller's dispatcher. Without one it is
    /// spawned on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if no dispatcher was set and the caller is not inside a tokio
    /// runtime.
    pub fn lift_when<F, Fut>(self: &Arc<Self>, period: Duration, condition: F) -> LiftWhenHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let dispatcher = self
            .dispatcher
            .clone()
            .unwrap_or_else(|| Arc::new(TokioDispatcher::current()));
        let poller = Arc::new(Poller::default());
        let controller = Arc::clone(self);
        let shared = Arc::clone(&poller);

        dispatcher.spawn(Box::pin(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    () = shared.cancel.notified() => break,
                    _ = ticker.tick() => {}
                }
                if controller.is_lifted() {
                    break;
                }
                let ready = tokio::select! {
                    biased;
                    () = shared.cancel.notified() => break,
                    ready = condition() => ready,
                };
                if ready {
                    controller.lift();
                    break;
                }
            }
            shared.finished.store(true, Ordering::SeqCst);
            debug!(controller = %controller.name, "Lift poller stopped");
        }));

        LiftWhenHandle { poller }
    }
}

impl<T> BarrierController<T> for ManualBarrierController<T>
where
    T: Clone + Send + 'static,
{
    fn on_barrier_created(&self, barrier: &Arc<Barrier<T>>) {
        {
            let mut state = self.state.lock();
            if !state.lifted {
                assert!(
                    !state.pending.contains_key(&barrier.id()),
                    "{} cannot be registered twice",
                    barrier.id()
                );
                state.pending.insert(barrier.id(), Registration::new(barrier));
                debug!(controller = %self.name, barrier = %barrier.id(), "Barrier registered");
                return;
            }
        }
        barrier.lift(None);
    }

    fn on_barrier_blocked(&self, barrier: &Barrier<T>) {
        let mut state = self.state.lock();
        let lifted = state.lifted;

        let Some(registration) = state.pending.get_mut(&barrier.id()) else {
            let was_interrupted = state.interrupted.remove(&barrier.id());
            assert!(
                lifted || was_interrupted,
                "{} was never registered with controller '{}'",
                barrier.id(),
                self.name
            );
            debug!(controller = %self.name, barrier = %barrier.id(), "Ignoring arrival of released barrier");
            return;
        };

        assert!(!registration.blocked, "{} cannot be marked blocked twice", barrier.id());
        registration.blocked = true;
        debug!(controller = %self.name, barrier = %barrier.id(), "Barrier arrived");
    }

    fn on_barrier_interrupted(&self, barrier: &Barrier<T>) {
        let mut state = self.state.lock();
        if state.pending.remove(&barrier.id()).is_none() {
            warn!(controller = %self.name, barrier = %barrier.id(), "Interrupted barrier was not pending");
        }
        if !state.lifted {
            state.interrupted.insert(barrier.id());
        }
    }
}

impl<T> fmt::Debug for ManualBarrierController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualBarrierController")
            .field("name", &self.name)
            .field("lifted", &state.lifted)
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Poller {
    cancel: Notify,
    finished: AtomicBool,
}

/// Handle to a running [`ManualBarrierController::lift_when`] poller.
///
/// Dropping the handle leaves the poller running.
#[derive(Debug)]
pub struct LiftWhenHandle {
    poller: Arc<Poller>,
}

impl LiftWhenHandle {
    /// Stops polling. The controller is left as it is.
    pub fn cancel(&self) {
        self.poller.cancel.notify_one();
    }

    /// Returns true once the poller has lifted the controller, seen it
    /// lifted, or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.poller.finished.load(Ordering::SeqCst)
    }
}
