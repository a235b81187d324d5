//! Test assertions for job states.

use crate::core::{State, StateKind};

/// Asserts that the job succeeded.
pub fn assert_succeeded(state: &State) {
    assert!(state.is_success(), "Expected success, got {state}");
}

/// Asserts that the job failed with exactly `causes` recorded causes.
pub fn assert_failed_with(state: &State, causes: usize) {
    assert!(state.is_failure(), "Expected failure, got {state}");
    assert_eq!(
        state.causes().len(),
        causes,
        "Expected {causes} causes, got {:?}",
        state.causes()
    );
}

/// Asserts that the recorded states have exactly the given kinds.
pub fn assert_kinds(states: &[StateKind], expected: &[StateKind]) {
    assert_eq!(
        states, expected,
        "Expected transitions {expected:?}, got {states:?}"
    );
}
