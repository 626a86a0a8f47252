//! Sparse integer-indexed arrays.

use serde::{Deserialize, Serialize};

/// A growable array where each slot is either unset or holds one value.
///
/// Reads past the end are simply unset; writes grow the array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SparseField<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for SparseField<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> SparseField<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size to `len` unset slots.
    pub fn with_len(len: usize) -> Self {
        let mut field = Self::new();
        field.reserve(len);
        field
    }

    /// Ensure at least `len` slots exist.
    pub fn reserve(&mut self, len: usize) {
        if self.slots.len() < len {
            self.slots.resize_with(len, || None);
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Store `value`, returning the previous one.
    pub fn set(&mut self, index: usize, value: T) -> Option<T> {
        self.reserve(index + 1);
        self.slots[index].replace(value)
    }

    pub fn take(&mut self, index: usize) -> Option<T> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Get the slot, inserting `default()` if unset.
    pub fn get_or_insert_with(&mut self, index: usize, default: impl FnOnce() -> T) -> &mut T {
        self.reserve(index + 1);
        self.slots[index].get_or_insert_with(default)
    }

    /// Number of slots, set or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of set slots.
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Set slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }
}

impl<T> FromIterator<(usize, T)> for SparseField<T> {
    fn from_iter<I: IntoIterator<Item = (usize, T)>>(iter: I) -> Self {
        let mut field = Self::new();
        for (i, v) in iter {
            field.set(i, v);
        }
        field
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_is_unset() {
        let field: SparseField<i32> = SparseField::new();
        assert_eq!(field.get(10), None);
        assert!(!field.is_set(0));
    }

    #[test]
    fn test_set_grows_and_iterates_in_order() {
        let mut field = SparseField::new();
        assert_eq!(field.set(3, 30), None);
        assert_eq!(field.set(1, 10), None);
        assert_eq!(field.set(3, 31), Some(30));
        assert_eq!(field.len(), 4);
        assert_eq!(field.count(), 2);
        let items: Vec<_> = field.iter().map(|(i, v)| (i, *v)).collect();
        assert_eq!(items, vec![(1, 10), (3, 31)]);
    }

    #[test]
    fn test_reserve_keeps_slots_unset() {
        let mut field: SparseField<f64> = SparseField::with_len(5);
        assert_eq!(field.len(), 5);
        assert_eq!(field.count(), 0);
        field.reserve(2);
        assert_eq!(field.len(), 5);
        *field.get_or_insert_with(2, || 0.0) += 1.5;
        assert_eq!(field.get(2), Some(&1.5));
        assert_eq!(field.take(2), Some(1.5));
        assert_eq!(field.take(2), None);
    }
}
