//! Core domain model types for pipeflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - The per-job state machine
//! - The identity trait items must implement

mod identity;
mod state;

pub use identity::Identifiable;
pub use state::{RunningState, State, StateKind, TerminalState};
