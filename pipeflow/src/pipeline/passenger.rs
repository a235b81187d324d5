//! The item a pipeline job carries through its steps.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use crate::core::Identifiable;

/// User data travelling through a pipeline, tagged with its job's identity
/// and submission position.
///
/// Passengers compare by position, so a batch sorted for aggregation is in
/// submission order. Equality and hashing ignore the data.
#[derive(Clone)]
pub struct Passenger<T> {
    data: T,
    id: Uuid,
    position: u64,
}

impl<T> Passenger<T> {
    pub(crate) fn new(data: T, id: Uuid, position: u64) -> Self {
        Self { data, id, position }
    }

    /// Returns the carried data.
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Consumes the passenger and returns its data.
    pub fn into_data(self) -> T {
        self.data
    }

    /// Submission position of the job.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns a passenger with the same identity carrying `data`.
    #[must_use]
    pub fn replace<U>(&self, data: U) -> Passenger<U> {
        Passenger {
            data,
            id: self.id,
            position: self.position,
        }
    }
}

impl<T> Identifiable for Passenger<T> {
    fn id(&self) -> Uuid {
        self.id
    }
}

impl<T> PartialEq for Passenger<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.position == other.position
    }
}

impl<T> Eq for Passenger<T> {}

impl<T> Hash for Passenger<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.position.hash(state);
    }
}

impl<T> PartialOrd for Passenger<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Passenger<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl<T: fmt::Debug> fmt::Debug for Passenger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passenger")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("data", &self.data)
            .finish()
    }
}
