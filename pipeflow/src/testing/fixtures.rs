//! Test fixtures for job testing.

use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::{Identifiable, State, StateKind};
use crate::errors::BoxError;
use crate::orchestrator::StateListener;

/// A small identifiable item carrying a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestItem {
    /// Stable identity.
    pub id: Uuid,
    /// Payload.
    pub value: u32,
}

impl TestItem {
    /// Creates an item with a fresh identity.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            value,
        }
    }

    /// Returns the same item carrying `value`.
    #[must_use]
    pub fn with_value(&self, value: u32) -> Self {
        Self { id: self.id, value }
    }
}

impl Identifiable for TestItem {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// A listener recording every state it is shown.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    states: Arc<Mutex<Vec<State>>>,
}

impl RecordingListener {
    /// Creates an empty recorder. Clones share the recording.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded state in order.
    #[must_use]
    pub fn states(&self) -> Vec<State> {
        self.states.lock().clone()
    }

    /// Returns the kinds of every recorded state.
    #[must_use]
    pub fn kinds(&self) -> Vec<StateKind> {
        self.states.lock().iter().map(State::kind).collect()
    }

    /// Number of recorded states of `kind`.
    #[must_use]
    pub fn count_of(&self, kind: StateKind) -> usize {
        self.states.lock().iter().filter(|s| s.kind() == kind).count()
    }
}

impl StateListener for RecordingListener {
    fn on_state_changed(&self, _job_id: Uuid, _previous: &State, next: &State) -> Result<(), BoxError> {
        self.states.lock().push(next.clone());
        Ok(())
    }
}

/// A listener that rejects the first transition into a given kind.
#[derive(Debug)]
pub struct FailingListener {
    kind: StateKind,
    fired: Mutex<bool>,
}

impl FailingListener {
    /// Fails once, on the first transition into `kind`.
    #[must_use]
    pub fn on(kind: StateKind) -> Self {
        Self {
            kind,
            fired: Mutex::new(false),
        }
    }
}

impl StateListener for FailingListener {
    fn on_state_changed(&self, _job_id: Uuid, _previous: &State, next: &State) -> Result<(), BoxError> {
        let mut fired = self.fired.lock();
        if *fired || next.kind() != self.kind {
            return Ok(());
        }
        *fired = true;
        Err(anyhow::anyhow!("listener rejected {}", self.kind).into())
    }
}
