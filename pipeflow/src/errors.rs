//! Error types for the pipeflow engine.
//!
//! Expected runtime outcomes (a failed step attempt, an exhausted retry
//! budget, an interruption, a failed aggregation) are modelled as values and
//! end up as causes on [`TerminalState::Failure`](crate::core::TerminalState).
//! Contract violations by the caller panic instead.

use std::error::Error;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

/// Boxed error returned by user-supplied steps and aggregation functions.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Shareable error, used where causes must be cloned into several states.
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// A cause attached to a job's failure states.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// A single attempt of a step returned an error or panicked.
    #[error("job {job_id} failed on attempt {attempt} of step '{step}'")]
    StepFailed {
        /// The failing job.
        job_id: Uuid,
        /// Name of the step.
        step: String,
        /// Zero-based attempt index.
        attempt: u32,
        /// What the step reported.
        #[source]
        source: SharedError,
    },

    /// A step attempt was interrupted, either by the job or by the step itself.
    #[error("job {job_id} was interrupted at step '{step}' on attempt {attempt}")]
    StepInterrupted {
        /// The interrupted job.
        job_id: Uuid,
        /// Name of the step.
        step: String,
        /// Zero-based attempt index.
        attempt: u32,
    },

    /// Every allowed attempt of a step failed.
    #[error("job {job_id} ran out of the max allowed {max_attempts} attempts for step '{step}'")]
    OutOfAttempts {
        /// The failing job.
        job_id: Uuid,
        /// Name of the exhausted step.
        step: String,
        /// The step's attempt budget.
        max_attempts: u32,
        /// Cause of the last attempt.
        #[source]
        source: Option<Box<JobError>>,
    },

    /// The job was interrupted and will not run any further step.
    #[error("job {job_id} was prematurely interrupted")]
    Interrupted {
        /// The interrupted job.
        job_id: Uuid,
        /// Cause of the attempt that observed the interruption, if any.
        #[source]
        source: Option<Box<JobError>>,
    },

    /// A state listener returned an error or panicked.
    #[error("state listener failed for job {job_id}")]
    Listener {
        /// The job whose listener failed.
        job_id: Uuid,
        /// What the listener reported.
        #[source]
        source: SharedError,
    },
}

impl JobError {
    /// Creates a step failure cause.
    pub fn step_failed(job_id: Uuid, step: impl Into<String>, attempt: u32, source: BoxError) -> Self {
        Self::StepFailed {
            job_id,
            step: step.into(),
            attempt,
            source: Arc::from(source),
        }
    }

    /// Creates a step interruption cause.
    pub fn step_interrupted(job_id: Uuid, step: impl Into<String>, attempt: u32) -> Self {
        Self::StepInterrupted {
            job_id,
            step: step.into(),
            attempt,
        }
    }

    /// Creates an out-of-attempts cause wrapping the last attempt's cause.
    pub fn out_of_attempts(
        job_id: Uuid,
        step: impl Into<String>,
        max_attempts: u32,
        last: Option<Self>,
    ) -> Self {
        Self::OutOfAttempts {
            job_id,
            step: step.into(),
            max_attempts,
            source: last.map(Box::new),
        }
    }

    /// Creates a job interruption cause.
    pub fn interrupted(job_id: Uuid, last: Option<Self>) -> Self {
        Self::Interrupted {
            job_id,
            source: last.map(Box::new),
        }
    }

    /// Creates a listener failure cause.
    pub fn listener(job_id: Uuid, source: BoxError) -> Self {
        Self::Listener {
            job_id,
            source: Arc::from(source),
        }
    }

    /// Returns the job this cause belongs to.
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::StepFailed { job_id, .. }
            | Self::StepInterrupted { job_id, .. }
            | Self::OutOfAttempts { job_id, .. }
            | Self::Interrupted { job_id, .. }
            | Self::Listener { job_id, .. } => *job_id,
        }
    }

    /// Returns true for causes produced by an interruption.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::StepInterrupted { .. } | Self::Interrupted { .. })
    }
}

/// Error delivered to every job waiting at a counted barrier when its
/// release fails.
#[derive(Debug, Clone, Error)]
pub enum BarrierError {
    /// The aggregation function returned an error or panicked.
    #[error("barrier aggregation failed")]
    AggregationFailed(#[source] SharedError),

    /// The aggregation function returned the wrong number of results.
    #[error("barrier aggregation returned {actual} results for {expected} inputs")]
    SizeMismatch {
        /// Number of arrived inputs.
        expected: usize,
        /// Number of results returned.
        actual: usize,
    },
}

impl BarrierError {
    /// Wraps an aggregation error.
    pub fn aggregation_failed(source: BoxError) -> Self {
        Self::AggregationFailed(Arc::from(source))
    }
}

/// Errors raised by repositories.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    /// An item with the same id is already stored.
    #[error("an item with id {0} already exists")]
    DuplicateId(Uuid),
}

/// Message carried by a panic payload, if it is a string.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Error created from a caught panic.
#[derive(Debug, Clone, Error)]
#[error("panicked: {0}")]
pub struct PanicError(pub String);

impl PanicError {
    /// Builds the error from a panic payload.
    pub fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        Self(panic_message(payload))
    }
}

/// Renders an error followed by its `source()` chain, one cause per line.
pub fn cause_chain(err: &(dyn Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        rendered.push_str("\nCaused by: ");
        rendered.push_str(&cause.to_string());
        current = cause.source();
    }
    rendered
}
