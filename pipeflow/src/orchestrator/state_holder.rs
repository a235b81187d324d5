//! Ordered state publication for one job.

use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{State, StateKind};
use crate::errors::{cause_chain, BoxError, JobError, PanicError};
use crate::events::EventSink;

/// Receives every state transition of a job, in order.
///
/// Returning an error (or panicking) fails the job: it moves straight to
/// `Terminal.Failure` with the error recorded as a cause.
pub trait StateListener: Send + Sync {
    /// Called after the job moved from `previous` to `next`.
    fn on_state_changed(&self, job_id: Uuid, previous: &State, next: &State) -> Result<(), BoxError>;
}

impl<F> StateListener for F
where
    F: Fn(Uuid, &State, &State) -> Result<(), BoxError> + Send + Sync,
{
    fn on_state_changed(&self, job_id: Uuid, previous: &State, next: &State) -> Result<(), BoxError> {
        self(job_id, previous, next)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(SubscriptionId, Arc<dyn StateListener>)>,
}

/// Owns a job's current state and notifies listeners of each transition.
pub(crate) struct StateHolder {
    job_id: Uuid,
    /// Serializes transitions together with their notifications.
    ordering: Mutex<()>,
    current: RwLock<State>,
    listeners: Mutex<Listeners>,
    terminal: watch::Sender<State>,
    events: Arc<dyn EventSink>,
}

impl StateHolder {
    pub(crate) fn new(job_id: Uuid, events: Arc<dyn EventSink>) -> Self {
        let (terminal, _) = watch::channel(State::Scheduled);
        Self {
            job_id,
            ordering: Mutex::new(()),
            current: RwLock::new(State::Scheduled),
            listeners: Mutex::new(Listeners::default()),
            terminal,
            events,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.current.read().clone()
    }

    pub(crate) fn subscribe(&self, listener: Arc<dyn StateListener>) -> SubscriptionId {
        let mut listeners = self.listeners.lock();
        let id = SubscriptionId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry, _)| *entry != id);
        listeners.entries.len() != before
    }

    pub(crate) fn unsubscribe_all(&self) {
        self.listeners.lock().entries.clear();
    }

    /// Waits until the job reaches a terminal state and returns it.
    pub(crate) async fn wait_for_terminal(&self) -> State {
        let mut receiver = self.terminal.subscribe();
        let outcome = receiver.wait_for(State::is_terminal).await.map(|state| state.clone());
        outcome.unwrap_or_else(|_| self.state())
    }

    /// Applies `transition` to the current state and notifies listeners.
    ///
    /// If a listener fails, the job is aborted into `Terminal.Failure`,
    /// listeners are told about the abort, and the listener's cause is
    /// returned.
    pub(crate) fn transition(&self, transition: impl FnOnce(&State) -> State) -> Result<(), JobError> {
        let _ordering = self.ordering.lock();
        let previous = self.state();
        let next = transition(&previous);
        self.record(&previous, &next);

        let listeners: Vec<_> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let failed = listeners
            .iter()
            .find_map(|listener| self.notify(listener.as_ref(), &previous, &next).err());

        let Some(cause) = failed else {
            self.terminal.send_replace(next);
            return Ok(());
        };

        let aborted = next.abort(cause.clone());
        warn!(job_id = %self.job_id, error = %cause_chain(&cause), "State listener failed, aborting job");
        self.record(&next, &aborted);
        for listener in &listeners {
            if let Err(err) = self.notify(listener.as_ref(), &next, &aborted) {
                warn!(job_id = %self.job_id, error = %err, "State listener failed on abort");
            }
        }
        self.terminal.send_replace(aborted);
        Err(cause)
    }

    fn notify(&self, listener: &dyn StateListener, previous: &State, next: &State) -> Result<(), JobError> {
        match catch_unwind(AssertUnwindSafe(|| listener.on_state_changed(self.job_id, previous, next))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(JobError::listener(self.job_id, err)),
            Err(payload) => Err(JobError::listener(
                self.job_id,
                Box::new(PanicError::from_payload(payload.as_ref())),
            )),
        }
    }

    fn record(&self, previous: &State, next: &State) {
        *self.current.write() = next.clone();

        match next.kind() {
            StateKind::Failure => {
                error!(job_id = %self.job_id, state = %next, "Job failed");
                for cause in next.causes() {
                    debug!(job_id = %self.job_id, cause = %cause_chain(cause), "Failure cause");
                }
            }
            StateKind::AttemptFailed => {
                info!(job_id = %self.job_id, state = %next, "Job transitioned");
                if let Some(cause) = next.cause() {
                    debug!(job_id = %self.job_id, cause = %cause_chain(cause), "Attempt failure cause");
                }
            }
            _ => info!(job_id = %self.job_id, state = %next, "Job transitioned"),
        }

        self.events.try_emit(
            "job.state_changed",
            Some(serde_json::json!({
                "job_id": self.job_id,
                "previous": previous.kind(),
                "state": next.kind(),
                "step": next.step(),
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use pretty_assertions::assert_eq;

    fn holder() -> (Arc<CollectingEventSink>, StateHolder) {
        let sink = Arc::new(CollectingEventSink::new());
        let holder = StateHolder::new(Uuid::new_v4(), sink.clone());
        (sink, holder)
    }

    #[test]
    fn test_listeners_see_transitions_in_order() {
        let (sink, holder) = holder();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        holder.subscribe(Arc::new(move |_: Uuid, previous: &State, next: &State| -> Result<(), BoxError> {
            log.lock().push((previous.kind(), next.kind()));
            Ok(())
        }));

        holder.transition(|s| s.on_success(Some("a"))).unwrap();
        holder.transition(|s| s.on_success(None)).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (StateKind::Scheduled, StateKind::Attempting),
                (StateKind::Attempting, StateKind::AttemptSuccessful),
            ]
        );
        assert_eq!(sink.payloads_of("job.state_changed")[1]["state"], "attempt_successful");
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let (_, holder) = holder();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let id = holder.subscribe(Arc::new(move |_: Uuid, _: &State, _: &State| -> Result<(), BoxError> {
            *counter.lock() += 1;
            Ok(())
        }));

        holder.transition(|s| s.on_success(Some("a"))).unwrap();
        assert!(holder.unsubscribe(id));
        assert!(!holder.unsubscribe(id));
        holder.transition(|s| s.on_success(None)).unwrap();

        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_failing_listener_aborts() {
        let (_, holder) = holder();
        holder.subscribe(Arc::new(|_: Uuid, _: &State, next: &State| -> Result<(), BoxError> {
            if next.is_success() {
                return Err("rejected".into());
            }
            Ok(())
        }));

        let cause = holder.transition(|s| s.on_success(None)).unwrap_err();
        assert!(matches!(cause, JobError::Listener { .. }));

        let state = holder.state();
        assert!(state.is_failure());
        assert_eq!(state.causes().len(), 1);
    }

    #[test]
    fn test_panicking_listener_aborts() {
        let (_, holder) = holder();
        holder.subscribe(Arc::new(|_: Uuid, _: &State, _: &State| -> Result<(), BoxError> {
            panic!("listener exploded")
        }));

        let cause = holder.transition(|s| s.on_success(Some("a"))).unwrap_err();
        assert!(cause_chain(&cause).contains("listener exploded"));
        assert!(holder.state().is_failure());
    }

    #[tokio::test]
    async fn test_wait_for_terminal() {
        let (_, holder) = holder();
        holder.transition(|s| s.on_success(None)).unwrap();
        assert!(holder.wait_for_terminal().await.is_success());
    }
}
