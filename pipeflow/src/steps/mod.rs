//! Steps and step descriptors.
//!
//! A step is one named, retryable unit of work applied to a job's item.

use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

use crate::errors::BoxError;

/// Outcome of one step attempt.
///
/// `Ok(None)` reports that the step was interrupted; it is not a failure.
pub type StepResult<T> = Result<Option<T>, BoxError>;

/// Trait for steps.
///
/// Implementations must return an item with the same identity as the one
/// they received.
#[async_trait]
pub trait Step<T: Send + 'static>: Send + Sync {
    /// Runs one attempt of the step.
    async fn run(&self, input: T) -> StepResult<T>;

    /// Asks an in-flight attempt to stop early.
    ///
    /// Interruption is cooperative; the default does nothing.
    fn interrupt(&self) {}
}

/// An async function-based step.
pub struct FnStep<F> {
    func: F,
}

impl<F> FnStep<F> {
    /// Creates a new function-based step.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Debug for FnStep<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F, Fut> Step<T> for FnStep<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult<T>> + Send + 'static,
{
    async fn run(&self, input: T) -> StepResult<T> {
        (self.func)(input).await
    }
}

/// A named step with its attempt budget.
pub struct StepDescriptor<T: Send + 'static> {
    name: String,
    max_attempts: u32,
    step: Arc<dyn Step<T>>,
}

impl<T: Send + 'static> StepDescriptor<T> {
    /// Creates a new descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero.
    pub fn new(name: impl Into<String>, max_attempts: u32, step: Arc<dyn Step<T>>) -> Self {
        let name = name.into();
        assert!(
            max_attempts >= 1,
            "step '{name}' must allow at least one attempt"
        );
        Self {
            name,
            max_attempts,
            step,
        }
    }

    /// Creates a descriptor around an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, max_attempts: u32, func: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult<T>> + Send + 'static,
    {
        Self::new(name, max_attempts, Arc::new(FnStep::new(func)))
    }

    /// Returns the step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the attempt budget.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the step itself.
    pub fn step(&self) -> &Arc<dyn Step<T>> {
        &self.step
    }
}

impl<T: Send + 'static> Clone for StepDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            max_attempts: self.max_attempts,
            step: Arc::clone(&self.step),
        }
    }
}

impl<T: Send + 'static> Debug for StepDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
