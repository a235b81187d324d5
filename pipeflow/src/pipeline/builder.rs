//! Fluent declaration of a pipeline.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::{Passenger, Pipeline};
use crate::barrier::{Aggregator, FnAggregator};
use crate::dispatch::{Dispatcher, TokioDispatcher};
use crate::errors::{BarrierError, BoxError};
use crate::events::{EventSink, NoOpEventSink};
use crate::repository::MutableRepository;
use crate::steps::{FnStep, Step, StepResult};

use super::Job;

/// Configuration of a counted barrier point.
pub struct CountedBarrierSpec<T: Send + 'static> {
    pub(crate) capacity: usize,
    pub(crate) attempts: u32,
    pub(crate) aggregator: Option<Arc<dyn Aggregator<T>>>,
}

impl<T: Send + 'static> CountedBarrierSpec<T> {
    /// Unbounded capacity, one attempt, no aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capacity: usize::MAX,
            attempts: 1,
            aggregator: None,
        }
    }

    /// Sets how many jobs the barrier waits for.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets how many times a job may arrive after failed aggregations.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the batch function run once per release over the arrived
    /// jobs' data, in submission order.
    ///
    /// It must return exactly one output per input, in the same order.
    #[must_use]
    pub fn with_aggregator<F, Fut>(mut self, aggregator: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, BoxError>> + Send + 'static,
    {
        self.aggregator = Some(Arc::new(FnAggregator::new(aggregator)));
        self
    }
}

impl<T: Send + 'static> Default for CountedBarrierSpec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> fmt::Debug for CountedBarrierSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountedBarrierSpec")
            .field("capacity", &self.capacity)
            .field("attempts", &self.attempts)
            .field("aggregates", &self.aggregator.is_some())
            .finish()
    }
}

/// One declared point of a pipeline.
pub(crate) enum Operation<T: Send + 'static> {
    Step {
        name: String,
        attempts: u32,
        step: Arc<dyn Step<T>>,
    },
    ManualBarrier {
        name: String,
    },
    CountedBarrier {
        name: String,
        spec: CountedBarrierSpec<T>,
    },
}

impl<T: Send + 'static> Operation<T> {
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Step { name, .. } | Self::ManualBarrier { name } | Self::CountedBarrier { name, .. } => name,
        }
    }
}

/// Runs a step over a passenger's data and keeps its identity.
pub(crate) struct DataStep<T: Send + 'static> {
    inner: Arc<dyn Step<T>>,
}

impl<T: Send + 'static> DataStep<T> {
    pub(crate) fn new(inner: Arc<dyn Step<T>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T> Step<Passenger<T>> for DataStep<T>
where
    T: Send + Sync + 'static,
{
    async fn run(&self, input: Passenger<T>) -> StepResult<Passenger<T>> {
        let envelope = input.replace(());
        let output = self.inner.run(input.into_data()).await?;
        Ok(output.map(|data| envelope.replace(data)))
    }

    fn interrupt(&self) {
        self.inner.interrupt();
    }
}

/// Runs a data aggregator over a batch of passengers.
pub(crate) struct PassengerAggregator<T: Send + 'static> {
    inner: Arc<dyn Aggregator<T>>,
}

impl<T: Send + 'static> PassengerAggregator<T> {
    pub(crate) fn new(inner: Arc<dyn Aggregator<T>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T> Aggregator<Passenger<T>> for PassengerAggregator<T>
where
    T: Send + Sync + 'static,
{
    async fn aggregate(&self, batch: Vec<Passenger<T>>) -> Result<Vec<Passenger<T>>, BoxError> {
        let envelopes: Vec<_> = batch.iter().map(|p| p.replace(())).collect();
        let data = batch.into_iter().map(Passenger::into_data).collect();
        let outputs = self.inner.aggregate(data).await?;

        if outputs.len() != envelopes.len() {
            return Err(Box::new(BarrierError::SizeMismatch {
                expected: envelopes.len(),
                actual: outputs.len(),
            }));
        }
        Ok(envelopes
            .iter()
            .zip(outputs)
            .map(|(envelope, data)| envelope.replace(data))
            .collect())
    }
}

/// Declares the steps and barrier points of a [`Pipeline`], in order.
pub struct PipelineBuilder<T: Send + 'static> {
    name: String,
    operations: Vec<Operation<T>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    events: Arc<dyn EventSink>,
}

impl<T> PipelineBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
            dispatcher: None,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets where jobs and barrier releases run.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Sets the sink receiving job and barrier events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Appends an async step retried up to `attempts` times.
    ///
    /// # Panics
    ///
    /// Panics if `attempts` is zero.
    #[must_use]
    pub fn step<F, Fut>(self, name: impl Into<String>, attempts: u32, func: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let step = FnStep::new(move |data: T| {
            let output = func(data);
            async move { output.await.map(Some) }
        });
        self.step_with(name, attempts, Arc::new(step))
    }

    /// Appends a custom step, which may react to interruptions.
    ///
    /// # Panics
    ///
    /// Panics if `attempts` is zero.
    #[must_use]
    pub fn step_with(mut self, name: impl Into<String>, attempts: u32, step: Arc<dyn Step<T>>) -> Self {
        let name = name.into();
        assert!(attempts >= 1, "step '{name}' must allow at least one attempt");
        self.operations.push(Operation::Step { name, attempts, step });
        self
    }

    /// Appends a barrier released by [`ManualBarrierController::lift`](crate::barrier::ManualBarrierController::lift).
    #[must_use]
    pub fn manual_barrier(mut self, name: impl Into<String>) -> Self {
        self.operations.push(Operation::ManualBarrier { name: name.into() });
        self
    }

    /// Appends a barrier released once enough jobs are accounted for.
    ///
    /// # Panics
    ///
    /// Panics if `spec` was given zero attempts.
    #[must_use]
    pub fn counted_barrier(mut self, name: impl Into<String>, spec: CountedBarrierSpec<T>) -> Self {
        let name = name.into();
        assert!(spec.attempts >= 1, "barrier '{name}' must allow at least one attempt");
        self.operations.push(Operation::CountedBarrier { name, spec });
        self
    }

    /// Number of declared points.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if nothing was declared.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Creates the pipeline and one controller per barrier point. Jobs are
    /// stored in `repository`.
    ///
    /// # Panics
    ///
    /// Panics if no dispatcher was set and the caller is not inside a tokio
    /// runtime.
    pub fn build(self, repository: Arc<dyn MutableRepository<Job<T>>>) -> Pipeline<T> {
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(TokioDispatcher::current()));
        Pipeline::new(self.name, self.operations, repository, dispatcher, self.events)
    }
}

impl<T: Send + 'static> fmt::Debug for PipelineBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.operations.iter().map(Operation::name).collect();
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("operations", &names)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_data_step_keeps_identity() {
        let step = DataStep::new(Arc::new(FnStep::new(|x: u32| async move { Ok(Some(x * 3)) })));
        let input = Passenger::new(5, Uuid::new_v4(), 2);

        let output = step.run(input.clone()).await.unwrap().unwrap();
        assert_eq!(output, input);
        assert_eq!(*output.data(), 15);
    }

    #[tokio::test]
    async fn test_passenger_aggregator_rejects_wrong_size() {
        let inner = FnAggregator::new(|_: Vec<u32>| async { Ok::<_, BoxError>(vec![1, 2, 3]) });
        let aggregator = PassengerAggregator::new(Arc::new(inner));
        let batch = vec![Passenger::new(1, Uuid::new_v4(), 0)];

        let err = aggregator.aggregate(batch).await.unwrap_err();
        assert!(err.to_string().contains("3"));
    }

    #[test]
    #[should_panic(expected = "at least one attempt")]
    fn test_zero_attempt_barrier_panics() {
        let _ = PipelineBuilder::<u32>::new("p").counted_barrier("b", CountedBarrierSpec::new().with_attempts(0));
    }

    #[test]
    fn test_declaration_order() {
        let builder = PipelineBuilder::<u32>::new("p")
            .step("a", 1, |x| async move { Ok(x) })
            .manual_barrier("gate")
            .counted_barrier("batch", CountedBarrierSpec::new().with_capacity(2));

        assert_eq!(builder.len(), 3);
        let names: Vec<_> = builder.operations.iter().map(Operation::name).collect();
        assert_eq!(names, vec!["a", "gate", "batch"]);
    }
}
