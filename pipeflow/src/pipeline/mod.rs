//! The pipeline façade.
//!
//! A [`Pipeline`] is declared once with a [`PipelineBuilder`] and then
//! accepts any number of jobs through [`Pipeline::push`]. Every job gets its
//! own orchestrator and its own barrier at each barrier point; barriers of
//! the same point share one controller.

mod builder;
#[cfg(test)]
mod integration_tests;
mod job;
mod passenger;

pub use builder::{CountedBarrierSpec, PipelineBuilder};
pub use job::Job;
pub use passenger::Passenger;

use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::barrier::{Barrier, BarrierController, CountedBarrierController, ManualBarrierController};
use crate::dispatch::Dispatcher;
use crate::errors::{JobError, RepositoryError};
use crate::events::EventSink;
use crate::orchestrator::Orchestrator;
use crate::repository::MutableRepository;
use crate::steps::{Step, StepDescriptor};
use builder::{DataStep, Operation, PassengerAggregator};

/// Controller serving one barrier point.
enum PointController<T: Send + 'static> {
    Manual(Arc<ManualBarrierController<Passenger<T>>>),
    Counted(Arc<CountedBarrierController<Passenger<T>>>),
}

/// A declared sequence of steps and barrier points accepting jobs.
pub struct Pipeline<T: Send + 'static> {
    name: String,
    operations: Vec<Operation<T>>,
    /// One entry per barrier point, in declaration order.
    controllers: Vec<PointController<T>>,
    repository: Arc<dyn MutableRepository<Job<T>>>,
    dispatcher: Arc<dyn Dispatcher>,
    events: Arc<dyn EventSink>,
}

impl<T> Pipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        name: String,
        operations: Vec<Operation<T>>,
        repository: Arc<dyn MutableRepository<Job<T>>>,
        dispatcher: Arc<dyn Dispatcher>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let controllers = operations
            .iter()
            .filter_map(|operation| match operation {
                Operation::Step { .. } => None,
                Operation::ManualBarrier { name } => Some(PointController::Manual(Arc::new(
                    ManualBarrierController::new(name.clone()).with_dispatcher(Arc::clone(&dispatcher)),
                ))),
                Operation::CountedBarrier { name, spec } => {
                    let mut controller = CountedBarrierController::new(Arc::clone(&dispatcher))
                        .with_name(name.clone())
                        .with_capacity(spec.capacity)
                        .with_event_sink(Arc::clone(&events));
                    if let Some(aggregator) = &spec.aggregator {
                        controller = controller.with_aggregator(PassengerAggregator::new(Arc::clone(aggregator)));
                    }
                    Some(PointController::Counted(Arc::new(controller)))
                }
            })
            .collect();

        Self {
            name,
            operations,
            controllers,
            repository,
            dispatcher,
            events,
        }
    }

    /// Returns the pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controllers of the manual barrier points, in declaration order.
    pub fn manual_barriers(&self) -> Vec<Arc<ManualBarrierController<Passenger<T>>>> {
        self.controllers
            .iter()
            .filter_map(|controller| match controller {
                PointController::Manual(manual) => Some(Arc::clone(manual)),
                PointController::Counted(_) => None,
            })
            .collect()
    }

    /// Controllers of the counted barrier points, in declaration order.
    pub fn counted_barriers(&self) -> Vec<Arc<CountedBarrierController<Passenger<T>>>> {
        self.controllers
            .iter()
            .filter_map(|controller| match controller {
                PointController::Counted(counted) => Some(Arc::clone(counted)),
                PointController::Manual(_) => None,
            })
            .collect()
    }

    /// Submits `input` as a new job stored under `tag`.
    ///
    /// The job registers with every barrier point right away but does not
    /// run until [`Job::start`].
    ///
    /// # Panics
    ///
    /// Panics if a counted barrier point has already registered as many
    /// jobs as its capacity.
    pub fn push(&self, input: T, tag: Option<&str>) -> Result<Job<T>, RepositoryError> {
        let job = self.repository.add(
            tag,
            Box::new(move |id: Uuid, position: u64| self.create_job(input, id, position)),
        )?;
        info!(
            pipeline = %self.name,
            job_id = %job.id(),
            position = job.position(),
            tag = ?tag,
            "Job submitted"
        );
        Ok(job)
    }

    fn create_job(&self, input: T, id: Uuid, position: u64) -> Job<T> {
        let (steps, counted) = self.materialize_steps();
        let orchestrator = Orchestrator::builder(Passenger::new(input, id, position), steps)
            .with_dispatcher(Arc::clone(&self.dispatcher))
            .with_event_sink(Arc::clone(&self.events))
            .with_failure_callback(move |failed_at: usize, cause: &JobError| {
                let mut notified = 0;
                for (index, controller) in &counted {
                    if *index >= failed_at {
                        controller.notify_error();
                        notified += 1;
                    }
                }
                warn!(job_id = %cause.job_id(), step = failed_at, notified, "Job failed, reported as absent downstream");
            })
            .build();
        Job::new(orchestrator, position)
    }

    /// Builds a fresh step list for one job, along with the counted
    /// controllers keyed by their step index.
    #[allow(clippy::type_complexity)]
    fn materialize_steps(
        &self,
    ) -> (
        Vec<StepDescriptor<Passenger<T>>>,
        Vec<(usize, Arc<CountedBarrierController<Passenger<T>>>)>,
    ) {
        let mut controllers = self.controllers.iter();
        let mut counted = Vec::new();
        let mut steps = Vec::with_capacity(self.operations.len());

        for (index, operation) in self.operations.iter().enumerate() {
            let descriptor = match operation {
                Operation::Step { name, attempts, step } => {
                    StepDescriptor::new(name.clone(), *attempts, Arc::new(DataStep::new(Arc::clone(step))))
                }
                Operation::ManualBarrier { name } | Operation::CountedBarrier { name, .. } => {
                    let attempts = match operation {
                        Operation::CountedBarrier { spec, .. } => spec.attempts,
                        _ => 1,
                    };
                    let controller: Arc<dyn BarrierController<Passenger<T>>> = match controllers.next() {
                        Some(PointController::Manual(manual)) => Arc::clone(manual) as _,
                        Some(PointController::Counted(counted_controller)) => {
                            counted.push((index, Arc::clone(counted_controller)));
                            Arc::clone(counted_controller) as _
                        }
                        None => unreachable!("every barrier point has a controller"),
                    };
                    let barrier: Arc<dyn Step<Passenger<T>>> = Barrier::new(controller);
                    StepDescriptor::new(name.clone(), attempts, barrier)
                }
            };
            steps.push(descriptor);
        }
        (steps, counted)
    }
}

impl<T: Send + 'static> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.operations.iter().map(Operation::name).collect();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("operations", &names)
            .finish_non_exhaustive()
    }
}
