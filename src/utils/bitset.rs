//! Dense bit sets over small integer keys.
//!
//! Liveness, interference and definite-assignment all track sets of values or registers that
//! are identified by dense indices, so they share this one representation. Sets of equal
//! capacity can be merged in place; the allocator relies on that to keep one running
//! interference set per register slot.
//!
//! # Example
//!
//! ```rust,ignore
//! use dexhook::utils::BitSet;
//!
//! let mut live = BitSet::new(64);
//! live.insert(3);
//! live.insert(40);
//!
//! let mut other = BitSet::new(64);
//! other.insert(40);
//! assert!(live.intersects(&other));
//! assert_eq!(live.iter().collect::<Vec<_>>(), vec![3, 40]);
//! ```

/// A fixed-capacity bit vector.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    /// Creates an empty set able to hold `capacity` elements.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            len: capacity,
        }
    }

    /// Creates a set holding every element below `capacity`.
    #[must_use]
    pub fn full(capacity: usize) -> Self {
        let mut set = Self::new(capacity);
        set.fill();
        set
    }

    /// Capacity of the set.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no element is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Adds `index`, returning `true` if it was not present before.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn insert(&mut self, index: usize) -> bool {
        assert!(index < self.len, "index out of bounds");
        let mask = 1u64 << (index % 64);
        let word = &mut self.words[index / 64];
        let fresh = *word & mask == 0;
        *word |= mask;
        fresh
    }

    /// Removes `index`, returning `true` if it was present.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn remove(&mut self, index: usize) -> bool {
        assert!(index < self.len, "index out of bounds");
        let mask = 1u64 << (index % 64);
        let word = &mut self.words[index / 64];
        let present = *word & mask != 0;
        *word &= !mask;
        present
    }

    /// Returns `true` if `index` is present. Indices past the capacity are never present.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Number of elements present.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Removes every element.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Adds every element below the capacity.
    pub fn fill(&mut self) {
        self.words.iter_mut().for_each(|w| *w = u64::MAX);
        if self.len % 64 != 0 {
            if let Some(last) = self.words.last_mut() {
                *last = (1u64 << (self.len % 64)) - 1;
            }
        }
    }

    /// Grows the capacity to at least `capacity`, keeping the current elements.
    pub fn grow(&mut self, capacity: usize) {
        if capacity > self.len {
            self.words.resize(capacity.div_ceil(64), 0);
            self.len = capacity;
        }
    }

    /// In-place union. Returns `true` if `self` changed.
    pub fn union_with(&mut self, other: &Self) -> bool {
        assert_eq!(self.len, other.len, "bit sets must have same length");
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            let old = *a;
            *a |= *b;
            changed |= old != *a;
        }
        changed
    }

    /// In-place intersection. Returns `true` if `self` changed.
    pub fn intersect_with(&mut self, other: &Self) -> bool {
        assert_eq!(self.len, other.len, "bit sets must have same length");
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            let old = *a;
            *a &= *b;
            changed |= old != *a;
        }
        changed
    }

    /// Removes every element of `other`. Returns `true` if `self` changed.
    pub fn difference_with(&mut self, other: &Self) -> bool {
        assert_eq!(self.len, other.len, "bit sets must have same length");
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            let old = *a;
            *a &= !*b;
            changed |= old != *a;
        }
        changed
    }

    /// Returns `true` if the two sets share at least one element.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .any(|(a, b)| a & b != 0)
    }

    /// Iterates the elements in ascending order.
    pub fn iter(&self) -> BitSetIter<'_> {
        BitSetIter {
            words: &self.words,
            word_idx: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }
}

impl std::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Ascending iterator over a [`BitSet`].
pub struct BitSetIter<'a> {
    words: &'a [u64],
    word_idx: usize,
    current: u64,
}

impl Iterator for BitSetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.word_idx * 64 + bit);
            }
            self.word_idx += 1;
            self.current = *self.words.get(self.word_idx)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_insert_remove() {
        let mut bs = BitSet::new(130);
        assert!(bs.is_empty());
        assert!(bs.insert(0));
        assert!(bs.insert(129));
        assert!(!bs.insert(129));
        assert_eq!(bs.count(), 2);
        assert!(bs.remove(0));
        assert!(!bs.remove(0));
        assert!(!bs.contains(500));
    }

    #[test]
    fn test_bitset_full() {
        let bs = BitSet::full(70);
        assert_eq!(bs.count(), 70);
        assert_eq!(bs.iter().last(), Some(69));
    }

    #[test]
    fn test_bitset_set_operations() {
        let mut a = BitSet::new(100);
        let mut b = BitSet::new(100);
        a.insert(1);
        a.insert(2);
        b.insert(2);
        b.insert(3);

        let mut union = a.clone();
        assert!(union.union_with(&b));
        assert!(!union.union_with(&b));
        assert_eq!(union.iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        let mut inter = a.clone();
        assert!(inter.intersect_with(&b));
        assert_eq!(inter.iter().collect::<Vec<_>>(), vec![2]);

        let mut diff = a.clone();
        assert!(diff.difference_with(&b));
        assert_eq!(diff.iter().collect::<Vec<_>>(), vec![1]);

        assert!(a.intersects(&b));
    }

    #[test]
    fn test_bitset_grow_keeps_elements() {
        let mut bs = BitSet::new(10);
        bs.insert(9);
        bs.grow(200);
        bs.insert(199);
        assert_eq!(bs.iter().collect::<Vec<_>>(), vec![9, 199]);
    }
}
