//! Handle to one submitted pipeline job.

use std::fmt;
use uuid::Uuid;

use super::Passenger;
use crate::core::{Identifiable, State};
use crate::orchestrator::{Orchestrator, StateListener, SubscriptionId};

/// A job created by [`Pipeline::push`](super::Pipeline::push).
///
/// Clones refer to the same job.
pub struct Job<T: Send + 'static> {
    orchestrator: Orchestrator<Passenger<T>>,
    position: u64,
}

impl<T: Send + 'static> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            position: self.position,
        }
    }
}

impl<T> Job<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(orchestrator: Orchestrator<Passenger<T>>, position: u64) -> Self {
        Self {
            orchestrator,
            position,
        }
    }

    /// Returns the job id.
    pub fn id(&self) -> Uuid {
        Identifiable::id(&self.orchestrator)
    }

    /// Submission position within the pipeline's repository.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the current state.
    pub fn state(&self) -> State {
        self.orchestrator.state()
    }

    /// Returns the output of the last step once the job succeeded.
    pub fn result(&self) -> Option<T> {
        self.orchestrator.result().map(Passenger::into_data)
    }

    /// Starts the job. Later calls do nothing.
    pub fn start(&self) {
        self.orchestrator.start();
    }

    /// Interrupts the job.
    pub fn interrupt(&self) {
        self.orchestrator.interrupt();
    }

    /// Registers a listener for every later state transition.
    pub fn subscribe(&self, listener: impl StateListener + 'static) -> SubscriptionId {
        self.orchestrator.subscribe(listener)
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.orchestrator.unsubscribe(id)
    }

    /// Waits for the job to finish and returns its terminal state.
    pub async fn wait_for_terminal(&self) -> State {
        self.orchestrator.wait_for_terminal().await
    }
}

impl<T: Send + 'static> Identifiable for Job<T> {
    fn id(&self) -> Uuid {
        Identifiable::id(&self.orchestrator)
    }
}

impl<T: Send + 'static> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("orchestrator", &self.orchestrator)
            .field("position", &self.position)
            .finish()
    }
}
