//! Barriers and the controllers that decide when they release.
//!
//! A [`Barrier`] is one job's suspension point. Every job passing through
//! the same point of a pipeline gets its own barrier, and all of them are
//! registered with one shared [`BarrierController`]:
//!
//! - [`ManualBarrierController`] releases everything on an explicit `lift()`.
//! - [`CountedBarrierController`] releases once a capacity's worth of jobs
//!   has arrived or is known to be absent, optionally aggregating their
//!   inputs in one batch.
//!
//! Controllers decide under their own lock and act on barriers only after
//! releasing it.

mod counted;
#[cfg(test)]
mod counted_tests;
mod manual;
mod primitive;

pub use counted::{Aggregator, CountedBarrierController, FnAggregator};
pub use manual::{LiftWhenHandle, ManualBarrierController};
pub use primitive::{Barrier, BarrierId, BarrierStatus};

use std::sync::{Arc, Weak};

/// Policy shared by all barriers of one pipeline point.
///
/// Implementations must not call back into a barrier while holding a lock
/// that the barrier's own callbacks need.
pub trait BarrierController<T>: Send + Sync {
    /// Called once when `barrier` is created.
    fn on_barrier_created(&self, barrier: &Arc<Barrier<T>>);

    /// Called when a job arrives at `barrier` and is about to wait.
    fn on_barrier_blocked(&self, barrier: &Barrier<T>);

    /// Called when `barrier` has been interrupted.
    fn on_barrier_interrupted(&self, barrier: &Barrier<T>);
}

/// A controller's bookkeeping entry for one barrier.
struct Registration<T> {
    barrier: Weak<Barrier<T>>,
    blocked: bool,
}

impl<T> Registration<T> {
    fn new(barrier: &Arc<Barrier<T>>) -> Self {
        Self {
            barrier: Arc::downgrade(barrier),
            blocked: false,
        }
    }
}
