//! # Pipeflow
//!
//! Job orchestration with retryable steps and barrier rendezvous points.
//!
//! Pipeflow runs many independent jobs through the same ordered list of
//! steps, with support for:
//!
//! - **Retryable steps**: every step has an attempt budget; failures and
//!   panics are retried, and exhausted steps fail the job with a full cause
//!   chain
//! - **Observable state**: each job moves through a closed state machine and
//!   publishes every transition, in order, to its listeners
//! - **Barriers**: points where jobs wait for each other, released either
//!   manually or once enough jobs have arrived
//! - **Batch aggregation**: counted barriers can transform all arrived
//!   inputs at once and hand each job the output matching its own input
//! - **Cooperative interruption**: interrupting a job stops it at the next
//!   safe point, and cascades to its siblings at a counted barrier
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipeflow::prelude::*;
//! use std::sync::Arc;
//!
//! let pipeline = PipelineBuilder::new("thumbnails")
//!     .step("download", 3, |url: String| async move { fetch(url).await })
//!     .counted_barrier(
//!         "upload",
//!         CountedBarrierSpec::new()
//!             .with_capacity(10)
//!             .with_aggregator(|batch| async move { upload_all(batch).await }),
//!     )
//!     .build(Arc::new(InMemoryRepository::new()));
//!
//! let job = pipeline.push("https://example.com/a.png".into(), None)?;
//! job.start();
//! let state = job.wait_for_terminal().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod barrier;
pub mod core;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod repository;
pub mod steps;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::barrier::{
        Aggregator, Barrier, BarrierController, BarrierStatus, CountedBarrierController,
        FnAggregator, LiftWhenHandle, ManualBarrierController,
    };
    pub use crate::core::{Identifiable, RunningState, State, StateKind, TerminalState};
    pub use crate::dispatch::{Dispatcher, TokioDispatcher};
    pub use crate::errors::{cause_chain, BarrierError, BoxError, JobError, RepositoryError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::{Orchestrator, StateListener, SubscriptionId};
    pub use crate::pipeline::{CountedBarrierSpec, Job, Passenger, Pipeline, PipelineBuilder};
    pub use crate::repository::{InMemoryRepository, MutableRepository, Record, Repository};
    pub use crate::steps::{FnStep, Step, StepDescriptor, StepResult};
    pub use crate::utils::SortReplayer;
}
