//! Testing utilities for pipeflow jobs.
//!
//! This module provides:
//! - An identifiable test item
//! - Mock steps that count, fail, or block until interrupted
//! - Recording and failing state listeners
//! - Assertions over job states

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_failed_with, assert_kinds, assert_succeeded};
pub use fixtures::{FailingListener, RecordingListener, TestItem};
pub use mocks::{BlockingStep, CountingStep, FailingStep};
