//! Reversible index remapping between an ordering and its sorted ordering.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

const NOT_A_PERMUTATION: &str =
    "original and sorted must hold the same elements, possibly in different orders";

/// Replays the permutation that turned `original` into `sorted` onto other
/// lists of the same length.
///
/// Lets a batch operation run over sorted input while its output is
/// realigned to the caller's original order:
///
/// ```
/// use pipeflow::utils::SortReplayer;
///
/// let original = vec![3, 1, 2];
/// let mut sorted = original.clone();
/// sorted.sort_unstable();
///
/// let replayer = SortReplayer::new(&original, &sorted);
/// let outputs: Vec<i32> = sorted.iter().map(|x| x + 10).collect();
/// assert_eq!(replayer.reverse_apply_sort_transformations(outputs), vec![13, 11, 12]);
/// ```
#[derive(Debug, Clone)]
pub struct SortReplayer {
    /// `original index -> sorted index`; `None` when both inputs were the same slice.
    transformations: Option<Vec<usize>>,
    size: usize,
}

impl SortReplayer {
    /// Builds the replayer from two permutations of the same multiset.
    ///
    /// Duplicate elements are matched in order of appearance.
    ///
    /// # Panics
    ///
    /// Panics if the lengths differ or an element of `original` cannot be
    /// found in `sorted`.
    pub fn new<T: Eq + Hash>(original: &[T], sorted: &[T]) -> Self {
        assert!(original.len() == sorted.len(), "{NOT_A_PERMUTATION}");

        if std::ptr::eq(original, sorted) {
            return Self {
                transformations: None,
                size: original.len(),
            };
        }

        let mut positions: HashMap<&T, VecDeque<usize>> = HashMap::with_capacity(sorted.len());
        for (index, item) in sorted.iter().enumerate() {
            positions.entry(item).or_default().push_back(index);
        }

        let transformations = original
            .iter()
            .map(|item| {
                positions
                    .get_mut(item)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| panic!("{NOT_A_PERMUTATION}"))
            })
            .collect();

        Self {
            transformations: Some(transformations),
            size: original.len(),
        }
    }

    /// Number of elements the replayer was built for.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns true if the replayer was built from empty lists.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Reorders a list aligned with `original` so it aligns with `sorted`.
    ///
    /// # Panics
    ///
    /// Panics if `unsorted` has the wrong length.
    pub fn apply_sort_transformations<R>(&self, unsorted: Vec<R>) -> Vec<R> {
        assert!(
            unsorted.len() == self.size,
            "unsorted must have the same size as the list the replayer was built from"
        );
        let Some(transformations) = &self.transformations else {
            return unsorted;
        };

        let mut sorted: Vec<Option<R>> = std::iter::repeat_with(|| None).take(self.size).collect();
        for (item, &sorted_index) in unsorted.into_iter().zip(transformations) {
            sorted[sorted_index] = Some(item);
        }
        sorted.into_iter().flatten().collect()
    }

    /// Reorders a list aligned with `sorted` back so it aligns with `original`.
    ///
    /// # Panics
    ///
    /// Panics if `sorted` has the wrong length.
    pub fn reverse_apply_sort_transformations<R>(&self, sorted: Vec<R>) -> Vec<R> {
        assert!(
            sorted.len() == self.size,
            "sorted must have the same size as the list the replayer was built from"
        );
        let Some(transformations) = &self.transformations else {
            return sorted;
        };

        let mut slots: Vec<Option<R>> = sorted.into_iter().map(Some).collect();
        transformations
            .iter()
            .filter_map(|&sorted_index| slots[sorted_index].take())
            .collect()
    }
}
