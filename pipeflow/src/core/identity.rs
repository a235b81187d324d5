//! Identity shared by a job's item across step transformations.

use uuid::Uuid;

/// A value with a stable unique identity.
///
/// Every step of a job must hand back an item with the same id it received.
pub trait Identifiable {
    /// Returns the item's identity.
    fn id(&self) -> Uuid;
}

impl Identifiable for Uuid {
    fn id(&self) -> Uuid {
        *self
    }
}
