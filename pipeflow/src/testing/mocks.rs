//! Mock steps for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::steps::{Step, StepResult};

/// A step that passes its item through and counts calls.
#[derive(Debug, Default)]
pub struct CountingStep {
    calls: AtomicUsize,
}

impl CountingStep {
    /// Creates a new counting step.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of times the step ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> Step<T> for CountingStep {
    async fn run(&self, input: T) -> StepResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(input))
    }
}

/// A step that fails a number of times before passing its item through.
#[derive(Debug)]
pub struct FailingStep {
    error: String,
    failures: usize,
    calls: AtomicUsize,
}

impl FailingStep {
    /// Creates a step that never succeeds.
    #[must_use]
    pub fn always(error: impl Into<String>) -> Self {
        Self::times(usize::MAX, error)
    }

    /// Creates a step that fails `failures` times, then succeeds.
    #[must_use]
    pub fn times(failures: usize, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times the step ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> Step<T> for FailingStep {
    async fn run(&self, input: T) -> StepResult<T> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(anyhow::anyhow!("{} (call {})", self.error, call + 1).into());
        }
        Ok(Some(input))
    }
}

/// A step that waits until it is interrupted, then reports the interruption.
#[derive(Debug, Default)]
pub struct BlockingStep {
    entered: Notify,
    released: Notify,
    calls: AtomicUsize,
}

impl BlockingStep {
    /// Creates a new blocking step.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until an attempt is in flight.
    pub async fn running(&self) {
        self.entered.notified().await;
    }

    /// Returns the number of times the step ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> Step<T> for BlockingStep {
    async fn run(&self, _input: T) -> StepResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.released.notified().await;
        Ok(None)
    }

    fn interrupt(&self) {
        self.released.notify_one();
    }
}
