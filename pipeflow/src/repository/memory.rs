//! In-memory repository.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MutableRepository, Record, RecordFactory, Repository};
use crate::core::Identifiable;
use crate::errors::RepositoryError;

struct Entries<V> {
    records: Vec<Record<V>>,
    index: HashMap<Uuid, usize>,
    next_position: u64,
}

impl<V: Identifiable> Entries<V> {
    fn reindex(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(slot, record)| (record.value.id(), slot))
            .collect();
    }

    fn fresh_id(&self) -> Uuid {
        loop {
            let id = Uuid::new_v4();
            if !self.index.contains_key(&id) {
                return id;
            }
            warn!(%id, "Generated id already in use, retrying");
        }
    }
}

/// A repository kept in memory behind a read-write lock.
pub struct InMemoryRepository<V> {
    entries: RwLock<Entries<V>>,
}

impl<V> InMemoryRepository<V> {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries {
                records: Vec::new(),
                index: HashMap::new(),
                next_position: 0,
            }),
        }
    }
}

impl<V> Default for InMemoryRepository<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for InMemoryRepository<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRepository")
            .field("len", &self.entries.read().records.len())
            .finish()
    }
}

impl<V> Repository<V> for InMemoryRepository<V>
where
    V: Identifiable + Clone + Send + Sync,
{
    fn len(&self) -> usize {
        self.entries.read().records.len()
    }

    fn items(&self) -> Vec<Record<V>> {
        self.entries.read().records.clone()
    }

    fn get(&self, id: Uuid) -> Option<Record<V>> {
        let entries = self.entries.read();
        entries.index.get(&id).map(|&slot| entries.records[slot].clone())
    }

    fn get_by_tag(&self, tag: Option<&str>) -> Vec<Record<V>> {
        self.get_matching(&|record| record.tag.as_deref() == tag)
    }

    fn get_matching(&self, predicate: &dyn Fn(&Record<V>) -> bool) -> Vec<Record<V>> {
        self.entries
            .read()
            .records
            .iter()
            .filter(|record| predicate(record))
            .cloned()
            .collect()
    }
}

impl<V> MutableRepository<V> for InMemoryRepository<V>
where
    V: Identifiable + Clone + Send + Sync,
{
    fn add(&self, tag: Option<&str>, factory: RecordFactory<'_, V>) -> Result<V, RepositoryError> {
        let mut entries = self.entries.write();
        let id = entries.fresh_id();
        let position = entries.next_position;

        let value = factory(id, position);
        let stored_id = value.id();
        if entries.index.contains_key(&stored_id) {
            return Err(RepositoryError::DuplicateId(stored_id));
        }

        entries.next_position += 1;
        entries.records.push(Record {
            value: value.clone(),
            tag: tag.map(str::to_string),
            position,
            added_at: Utc::now(),
        });
        let slot = entries.records.len() - 1;
        entries.index.insert(stored_id, slot);
        debug!(id = %stored_id, position, tag = ?tag, "Record added");
        Ok(value)
    }

    fn remove_matching(&self, predicate: &dyn Fn(&Record<V>) -> bool) -> usize {
        let mut entries = self.entries.write();
        let before = entries.records.len();
        entries.records.retain(|record| !predicate(record));
        let removed = before - entries.records.len();
        if removed > 0 {
            entries.reindex();
        }
        removed
    }

    fn clear(&self) {
        let mut entries = self.entries.write();
        entries.records.clear();
        entries.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestItem;
    use pretty_assertions::assert_eq;

    fn add(repository: &InMemoryRepository<TestItem>, tag: Option<&str>, value: u32) -> TestItem {
        repository
            .add(tag, Box::new(move |id: Uuid, _: u64| TestItem { id, value }))
            .unwrap()
    }

    #[test]
    fn test_add_assigns_ids_and_positions() {
        let repository = InMemoryRepository::new();
        let first = add(&repository, Some("a"), 1);
        let second = add(&repository, None, 2);

        assert_ne!(first.id, second.id);
        assert_eq!(repository.len(), 2);
        assert_eq!(repository.get(first.id).unwrap().position, 0);
        assert_eq!(repository.get(second.id).unwrap().position, 1);
        assert_eq!(repository.get(second.id).unwrap().value, second);
    }

    #[test]
    fn test_lookup_by_tag() {
        let repository = InMemoryRepository::new();
        add(&repository, Some("red"), 1);
        add(&repository, Some("blue"), 2);
        add(&repository, Some("red"), 3);
        add(&repository, None, 4);

        let red: Vec<u32> = repository
            .get_by_tag(Some("red"))
            .into_iter()
            .map(|r| r.value.value)
            .collect();
        assert_eq!(red, vec![1, 3]);
        assert_eq!(repository.get_by_tag(None).len(), 1);
        assert!(repository.get_by_tag(Some("green")).is_empty());
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let repository = InMemoryRepository::new();
        let existing = add(&repository, None, 1);
        let id = existing.id;

        let err = repository
            .add(None, Box::new(move |_: Uuid, _: u64| existing.with_value(2)))
            .unwrap_err();
        assert_eq!(err, RepositoryError::DuplicateId(id));
        assert_eq!(repository.len(), 1);
    }

    #[test]
    fn test_remove_matching_keeps_index_consistent() {
        let repository = InMemoryRepository::new();
        let items: Vec<_> = (0..5).map(|v| add(&repository, None, v)).collect();

        let removed = repository.remove_matching(&|r| r.value.value % 2 == 0);
        assert_eq!(removed, 3);
        assert!(repository.get(items[0].id).is_none());
        assert_eq!(repository.get(items[3].id).unwrap().value.value, 3);
        assert_eq!(repository.get_matching(&|r| r.value.value > 0).len(), 2);

        let next = add(&repository, None, 9);
        assert_eq!(repository.get(next.id).unwrap().position, 5);
    }

    #[test]
    fn test_clear() {
        let repository = InMemoryRepository::new();
        let item = add(&repository, None, 1);
        repository.clear();

        assert!(repository.is_empty());
        assert!(repository.get(item.id).is_none());
        assert!(repository.items().is_empty());
    }
}
