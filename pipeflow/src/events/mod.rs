//! Event sinks for observability.
//!
//! Orchestrators emit `job.state_changed` on every transition and counted
//! barrier controllers emit `barrier.released` / `barrier.release_failed`.
//! Payloads are JSON objects.

mod sink;

pub use sink::{CollectingEventSink, Event, EventSink, LoggingEventSink, NoOpEventSink};
