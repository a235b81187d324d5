//! Storage for submitted jobs.
//!
//! A repository indexes [`Identifiable`] values by id and by an optional
//! tag. [`MutableRepository::add`] hands out the id and insertion position
//! so values can be built around them.

mod memory;

pub use memory::InMemoryRepository;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::Identifiable;
use crate::errors::RepositoryError;

/// Builds a value from its freshly allocated id and position.
pub type RecordFactory<'a, V> = Box<dyn FnOnce(Uuid, u64) -> V + Send + 'a>;

/// A stored value with its metadata.
#[derive(Debug, Clone)]
pub struct Record<V> {
    /// The stored value.
    pub value: V,
    /// Tag given when the value was added.
    pub tag: Option<String>,
    /// Insertion position, unique and increasing within one repository.
    pub position: u64,
    /// When the value was added.
    pub added_at: DateTime<Utc>,
}

impl<V: Identifiable> Identifiable for Record<V> {
    fn id(&self) -> Uuid {
        self.value.id()
    }
}

/// Read access to a repository.
pub trait Repository<V>: Send + Sync {
    /// Number of records.
    fn len(&self) -> usize;

    /// Returns true if there are no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records in insertion order.
    fn items(&self) -> Vec<Record<V>>;

    /// The record with the given id.
    fn get(&self, id: Uuid) -> Option<Record<V>>;

    /// Records added with `tag`, in insertion order.
    fn get_by_tag(&self, tag: Option<&str>) -> Vec<Record<V>>;

    /// Records matching `predicate`, in insertion order.
    fn get_matching(&self, predicate: &dyn Fn(&Record<V>) -> bool) -> Vec<Record<V>>;
}

/// A repository that can be written to. Implementations must be thread-safe.
pub trait MutableRepository<V>: Repository<V> {
    /// Allocates an unused id and the next position, builds the value with
    /// `factory` and stores it under `tag`.
    ///
    /// `factory` runs while the repository is locked and must not call back
    /// into it.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::DuplicateId`] if the built value's id is
    /// already stored.
    fn add(&self, tag: Option<&str>, factory: RecordFactory<'_, V>) -> Result<V, RepositoryError>;

    /// Removes every record matching `predicate` and returns how many were
    /// removed.
    fn remove_matching(&self, predicate: &dyn Fn(&Record<V>) -> bool) -> usize;

    /// Removes every record.
    fn clear(&self);
}
