//! The state machine governing one job's lifecycle.
//!
//! ```text
//! Scheduled -> Running.Attempting(step) -> Running.AttemptSuccessful(step) -> ... -> Terminal.Success
//!                        |                                                      \
//!                        v                                                       -> Terminal.Failure(causes)
//!              Running.AttemptFailed(step, cause) -> Running.Attempting(step)  (retry)
//! ```
//!
//! States are replaced on every transition, never mutated. Terminal states
//! are absorbing: a failure on `Terminal.Failure` appends to its causes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::JobError;

/// The state of a job.
#[derive(Debug, Clone)]
pub enum State {
    /// Created but not yet running.
    Scheduled,
    /// Executing one of its steps.
    Running(RunningState),
    /// Finished, successfully or not.
    Terminal(TerminalState),
}

/// Sub-states of [`State::Running`].
#[derive(Debug, Clone)]
pub enum RunningState {
    /// An attempt of `step` is in progress.
    #[non_exhaustive]
    Attempting {
        /// Step being attempted.
        step: String,
    },
    /// The last attempt of `step` succeeded.
    #[non_exhaustive]
    AttemptSuccessful {
        /// Step that succeeded.
        step: String,
    },
    /// The last attempt of `step` failed with `cause`.
    #[non_exhaustive]
    AttemptFailed {
        /// Step that failed.
        step: String,
        /// Why the attempt failed.
        cause: JobError,
    },
}

/// Sub-states of [`State::Terminal`].
#[derive(Debug, Clone)]
pub enum TerminalState {
    /// Every step succeeded.
    Success,
    /// The job failed. Causes are ordered oldest first.
    #[non_exhaustive]
    Failure {
        /// Accumulated failure causes.
        causes: Vec<JobError>,
    },
}

/// Flat, serializable discriminant of a [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// [`State::Scheduled`].
    Scheduled,
    /// [`RunningState::Attempting`].
    Attempting,
    /// [`RunningState::AttemptSuccessful`].
    AttemptSuccessful,
    /// [`RunningState::AttemptFailed`].
    AttemptFailed,
    /// [`TerminalState::Success`].
    Success,
    /// [`TerminalState::Failure`].
    Failure,
}

impl StateKind {
    /// Returns true for the two terminal kinds.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Attempting => write!(f, "attempting"),
            Self::AttemptSuccessful => write!(f, "attempt_successful"),
            Self::AttemptFailed => write!(f, "attempt_failed"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::Scheduled
    }
}

impl State {
    fn attempting(step: &str) -> Self {
        Self::Running(RunningState::Attempting {
            step: step.to_string(),
        })
    }

    fn failure(causes: Vec<JobError>) -> Self {
        Self::Terminal(TerminalState::Failure { causes })
    }

    /// Returns the flat discriminant of this state.
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Scheduled => StateKind::Scheduled,
            Self::Running(RunningState::Attempting { .. }) => StateKind::Attempting,
            Self::Running(RunningState::AttemptSuccessful { .. }) => StateKind::AttemptSuccessful,
            Self::Running(RunningState::AttemptFailed { .. }) => StateKind::AttemptFailed,
            Self::Terminal(TerminalState::Success) => StateKind::Success,
            Self::Terminal(TerminalState::Failure { .. }) => StateKind::Failure,
        }
    }

    /// Returns true once the job has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// Returns true for `Terminal.Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Terminal(TerminalState::Success))
    }

    /// Returns true for `Terminal.Failure`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Terminal(TerminalState::Failure { .. }))
    }

    /// Returns the step a running state refers to.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Running(
                RunningState::Attempting { step }
                | RunningState::AttemptSuccessful { step }
                | RunningState::AttemptFailed { step, .. },
            ) => Some(step),
            _ => None,
        }
    }

    /// Returns the cause of an `AttemptFailed` state.
    pub fn cause(&self) -> Option<&JobError> {
        match self {
            Self::Running(RunningState::AttemptFailed { cause, .. }) => Some(cause),
            _ => None,
        }
    }

    /// Returns the causes of a `Terminal.Failure`, or an empty slice.
    pub fn causes(&self) -> &[JobError] {
        match self {
            Self::Terminal(TerminalState::Failure { causes }) => causes,
            _ => &[],
        }
    }

    /// Transition taken when the current phase succeeds.
    ///
    /// `next_step` names the step to attempt next, or is `None` when the
    /// current phase completes without moving to a new step.
    ///
    /// # Panics
    ///
    /// Panics when `next_step` contradicts the current state: a name while
    /// an attempt is in flight or the job already succeeded, a retry of a
    /// different step than the failed one, or any success on
    /// `Terminal.Failure`.
    pub(crate) fn on_success(&self, next_step: Option<&str>) -> Self {
        let next = match (self, next_step) {
            (Self::Scheduled | Self::Running(RunningState::AttemptSuccessful { .. }), Some(step)) => {
                Self::attempting(step)
            }
            (Self::Scheduled | Self::Running(RunningState::AttemptSuccessful { .. }), None) => {
                Self::Terminal(TerminalState::Success)
            }
            (Self::Running(RunningState::Attempting { step }), None) => {
                Self::Running(RunningState::AttemptSuccessful { step: step.clone() })
            }
            (Self::Running(RunningState::Attempting { .. }), Some(next)) => {
                panic!("{self} cannot move to step '{next}' before the attempt completes")
            }
            (Self::Running(RunningState::AttemptFailed { step, .. }), Some(next)) if next == step => {
                Self::attempting(step)
            }
            (Self::Running(RunningState::AttemptFailed { step, .. }), other) => {
                panic!("{self} can only be retried with step '{step}', got {other:?}")
            }
            (Self::Terminal(TerminalState::Success), None) => self.clone(),
            (Self::Terminal(TerminalState::Success), Some(next)) => {
                panic!("{self} cannot move to step '{next}'")
            }
            (Self::Terminal(TerminalState::Failure { .. }), _) => {
                panic!("{self} cannot transition on success")
            }
        };
        debug_assert!(!matches!(next, Self::Scheduled));
        next
    }

    /// Transition taken when the current phase fails with `cause`.
    pub(crate) fn on_failure(&self, cause: JobError) -> Self {
        let next = match self {
            Self::Running(RunningState::Attempting { step }) => {
                Self::Running(RunningState::AttemptFailed {
                    step: step.clone(),
                    cause,
                })
            }
            Self::Running(RunningState::AttemptFailed { cause: previous, .. }) => {
                Self::failure(vec![previous.clone(), cause])
            }
            Self::Terminal(TerminalState::Failure { causes }) => {
                let mut causes = causes.clone();
                causes.push(cause);
                Self::failure(causes)
            }
            Self::Scheduled
            | Self::Running(RunningState::AttemptSuccessful { .. })
            | Self::Terminal(TerminalState::Success) => Self::failure(vec![cause]),
        };
        debug_assert!(matches!(
            next.kind(),
            StateKind::AttemptFailed | StateKind::Failure
        ));
        next
    }

    /// Moves straight to `Terminal.Failure`, whatever the current state.
    ///
    /// Used when an observer of the job fails: an in-flight attempt is not
    /// retried.
    pub(crate) fn abort(&self, cause: JobError) -> Self {
        let next = match self {
            Self::Running(RunningState::Attempting { .. }) => Self::failure(vec![cause]),
            other => other.on_failure(cause),
        };
        debug_assert!(next.is_failure());
        next
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Running(RunningState::Attempting { step }) => {
                write!(f, "Running.Attempting(step={step})")
            }
            Self::Running(RunningState::AttemptSuccessful { step }) => {
                write!(f, "Running.AttemptSuccessful(step={step})")
            }
            Self::Running(RunningState::AttemptFailed { step, cause }) => {
                write!(f, "Running.AttemptFailed(step={step}, cause={cause})")
            }
            Self::Terminal(TerminalState::Success) => write!(f, "Terminal.Success"),
            Self::Terminal(TerminalState::Failure { causes }) => {
                write!(f, "Terminal.Failure(causes={})", causes.len())
            }
        }
    }
}
