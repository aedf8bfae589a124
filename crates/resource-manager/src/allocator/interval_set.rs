//! Sorted set of disjoint closed ranges
//!
//! Backs both pool kinds: the integer pool keeps its free values here, and
//! the IP pool uses it (over `u128`) to merge address space before
//! re-expressing it as CIDR blocks.

use crate::models::{Range, Scalar};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Ranges added and removed between two versions of a set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeDelta<T: Scalar> {
    pub added: Vec<Range<T>>,
    pub removed: Vec<Range<T>>,
}

impl<T: Scalar> RangeDelta<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set of pairwise-disjoint, non-adjacent closed ranges
///
/// Keyed by range start. Every public mutation leaves the set minimal:
/// overlapping or touching ranges are merged into one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet<T: Scalar> {
    ranges: BTreeMap<T, T>,
}

impl<T: Scalar> IntervalSet<T> {
    pub fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    /// Set holding the single range
    pub fn from_range(range: Range<T>) -> Self {
        let mut set = Self::new();
        set.insert_range(range);
        set
    }

    /// Build a set, merging overlapping or adjacent input ranges
    pub fn from_ranges<I: IntoIterator<Item = Range<T>>>(ranges: I) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert_range(range);
        }
        set
    }

    /// Build a set from ranges that must already be pairwise disjoint
    ///
    /// Adjacent inputs are accepted and coalesced. Overlap is reported as
    /// `InvalidRange`.
    pub fn try_from_disjoint<I: IntoIterator<Item = Range<T>>>(ranges: I) -> Result<Self> {
        let mut set = Self::new();
        for range in ranges {
            if set.intersects(&range) {
                return Err(Error::InvalidRange(format!(
                    "{} overlaps another range in the set",
                    range
                )));
            }
            set.insert_range(range);
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of ranges held
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Number of values covered, saturating at `u128::MAX`
    pub fn count(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |acc, (s, e)| acc.saturating_add(T::span(*s, *e)))
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<T>> + '_ {
        self.ranges.iter().map(|(s, e)| Range::new(*s, *e))
    }

    pub fn to_vec(&self) -> Vec<Range<T>> {
        self.iter().collect()
    }

    /// Smallest value in the set
    pub fn first(&self) -> Option<T> {
        self.ranges.keys().next().copied()
    }

    /// Largest value in the set
    pub fn last(&self) -> Option<T> {
        self.ranges.values().next_back().copied()
    }

    /// Range holding `v`, if any
    pub fn range_containing(&self, v: T) -> Option<Range<T>> {
        self.ranges
            .range(..=v)
            .next_back()
            .filter(|(_, e)| **e >= v)
            .map(|(s, e)| Range::new(*s, *e))
    }

    pub fn contains(&self, v: T) -> bool {
        self.range_containing(v).is_some()
    }

    /// True when every value of `range` is in the set
    pub fn contains_range(&self, range: &Range<T>) -> bool {
        self.range_containing(range.start())
            .is_some_and(|r| r.contains_range(range))
    }

    /// True when the set shares at least one value with `range`
    pub fn intersects(&self, range: &Range<T>) -> bool {
        self.ranges
            .range(..=range.end())
            .next_back()
            .is_some_and(|(_, e)| *e >= range.start())
    }

    /// Smallest member `>= v`
    pub fn first_at_or_after(&self, v: T) -> Option<T> {
        if self.contains(v) {
            return Some(v);
        }
        self.ranges.range(v..).next().map(|(s, _)| *s)
    }

    /// Remove and return the smallest value
    ///
    /// The first range loses its first element; the remainder, if any, is
    /// put back.
    pub fn take_first(&mut self) -> Option<T> {
        let (start, end) = self.ranges.pop_first()?;
        if start < end {
            if let Some(next) = start.successor() {
                self.ranges.insert(next, end);
            }
        }
        Some(start)
    }

    /// Remove a specific value, splitting its range around it
    ///
    /// Returns false when `v` is not in the set.
    pub fn take(&mut self, v: T) -> bool {
        let Some(range) = self.range_containing(v) else {
            return false;
        };
        self.ranges.remove(&range.start());
        for part in range.difference(&Range::single(v)) {
            self.ranges.insert(part.start(), part.end());
        }
        true
    }

    /// Return a value to the set, coalescing with its neighbours
    ///
    /// Returns false when `v` was already present.
    pub fn give(&mut self, v: T) -> bool {
        if self.contains(v) {
            return false;
        }
        let mut start = v;
        let mut end = v;

        if let Some(below) = v.predecessor() {
            if let Some(left) = self.range_containing(below) {
                self.ranges.remove(&left.start());
                start = left.start();
            }
        }
        if let Some(above) = v.successor() {
            if let Some(right_end) = self.ranges.remove(&above) {
                end = right_end;
            }
        }

        self.ranges.insert(start, end);
        true
    }

    /// Add every value of `range`, merging with overlapping or adjacent ranges
    pub fn insert_range(&mut self, range: Range<T>) {
        let mut start = range.start();
        let mut end = range.end();
        let upper = end.successor().unwrap_or(T::MAX);

        let touching: Vec<(T, T)> = self
            .ranges
            .range(..=upper)
            .rev()
            .take_while(|(_, e)| e.successor().map_or(true, |after| after >= start))
            .map(|(s, e)| (*s, *e))
            .collect();

        for (s, e) in touching {
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.ranges.insert(start, end);
    }

    /// Remove every value of `range` from the set
    pub fn remove_range(&mut self, range: &Range<T>) {
        let hit: Vec<(T, T)> = self
            .ranges
            .range(..=range.end())
            .rev()
            .take_while(|(_, e)| **e >= range.start())
            .map(|(s, e)| (*s, *e))
            .collect();

        for (s, e) in hit {
            self.ranges.remove(&s);
            for part in Range::new(s, e).difference(range) {
                self.ranges.insert(part.start(), part.end());
            }
        }
    }

    /// Remove every value held by `other`
    pub fn subtract(&mut self, other: &IntervalSet<T>) {
        for range in other.iter() {
            self.remove_range(&range);
        }
    }

    /// Entries present here but not in `previous`, and the reverse
    ///
    /// Comparison is by whole entry, so a range that merely changed its
    /// end shows up as one removal plus one addition.
    pub fn diff(&self, previous: &IntervalSet<T>) -> RangeDelta<T> {
        let added = self
            .ranges
            .iter()
            .filter(|(s, e)| previous.ranges.get(*s) != Some(*e))
            .map(|(s, e)| Range::new(*s, *e))
            .collect();
        let removed = previous
            .ranges
            .iter()
            .filter(|(s, e)| self.ranges.get(*s) != Some(*e))
            .map(|(s, e)| Range::new(*s, *e))
            .collect();
        RangeDelta { added, removed }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

impl<T: Scalar> FromIterator<Range<T>> for IntervalSet<T> {
    fn from_iter<I: IntoIterator<Item = Range<T>>>(iter: I) -> Self {
        Self::from_ranges(iter)
    }
}

impl<T: Scalar> fmt::Display for IntervalSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", range)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u64, u64)]) -> IntervalSet<u64> {
        ranges.iter().map(|(a, b)| Range::new(*a, *b)).collect()
    }

    #[test]
    fn test_take_first_reinserts_remainder() {
        let mut s = set(&[(1, 3), (7, 7)]);
        assert_eq!(s.take_first(), Some(1));
        assert_eq!(s, set(&[(2, 3), (7, 7)]));
        assert_eq!(s.take_first(), Some(2));
        assert_eq!(s.take_first(), Some(3));
        assert_eq!(s.take_first(), Some(7));
        assert_eq!(s.take_first(), None);
        assert!(s.is_empty());
    }

    #[test]
    fn test_take_splits_range() {
        let mut s = set(&[(1, 10)]);
        assert!(s.take(5));
        assert_eq!(s.to_vec(), vec![Range::new(1, 4), Range::new(6, 10)]);
        assert!(!s.take(5));
        assert!(s.take(1));
        assert!(s.take(10));
        assert_eq!(s.to_vec(), vec![Range::new(2, 4), Range::new(6, 9)]);
    }

    #[test]
    fn test_give_coalesces_both_sides() {
        let mut s = set(&[(1, 4), (6, 10)]);
        assert!(s.give(5));
        assert_eq!(s.to_vec(), vec![Range::new(1, 10)]);
        assert!(!s.give(5));

        let mut s = set(&[(1, 2)]);
        assert!(s.give(9));
        assert_eq!(s.range_count(), 2);
        assert!(s.give(3));
        assert_eq!(s.to_vec(), vec![Range::new(1, 3), Range::new(9, 9)]);
    }

    #[test]
    fn test_give_at_domain_edges() {
        let mut s: IntervalSet<u64> = IntervalSet::new();
        assert!(s.give(0));
        assert!(s.give(u64::MAX));
        assert_eq!(s.range_count(), 2);
        assert_eq!(s.count(), 2);
    }

    #[test]
    fn test_insert_range_merges() {
        let mut s = set(&[(1, 2), (5, 6), (10, 12)]);
        s.insert_range(Range::new(3, 9));
        assert_eq!(s.to_vec(), vec![Range::new(1, 12)]);

        let mut s = set(&[(1, 2)]);
        s.insert_range(Range::new(4, 5));
        assert_eq!(s.range_count(), 2);
    }

    #[test]
    fn test_remove_range() {
        let mut s = set(&[(1, 10), (20, 30)]);
        s.remove_range(&Range::new(5, 25));
        assert_eq!(s.to_vec(), vec![Range::new(1, 4), Range::new(26, 30)]);
        s.remove_range(&Range::new(0, 100));
        assert!(s.is_empty());
    }

    #[test]
    fn test_diff_reports_changed_entries() {
        let before = set(&[(1, 10), (20, 30)]);
        let after = set(&[(1, 4), (6, 10), (20, 30)]);
        let delta = after.diff(&before);
        assert_eq!(delta.added, vec![Range::new(1, 4), Range::new(6, 10)]);
        assert_eq!(delta.removed, vec![Range::new(1, 10)]);
        assert!(after.diff(&after).is_empty());
    }

    #[test]
    fn test_try_from_disjoint_rejects_overlap() {
        assert!(IntervalSet::try_from_disjoint(vec![Range::new(1u64, 5), Range::new(6, 9)]).is_ok());
        assert!(matches!(
            IntervalSet::try_from_disjoint(vec![Range::new(1u64, 5), Range::new(5, 9)]),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn test_first_at_or_after() {
        let s = set(&[(3, 5), (9, 9)]);
        assert_eq!(s.first_at_or_after(0), Some(3));
        assert_eq!(s.first_at_or_after(4), Some(4));
        assert_eq!(s.first_at_or_after(6), Some(9));
        assert_eq!(s.first_at_or_after(10), None);
    }

    #[test]
    fn test_u128_full_domain() {
        let mut s = IntervalSet::from_range(Range::new(0u128, u128::MAX));
        assert!(s.take(0));
        assert!(s.take(u128::MAX));
        assert_eq!(s.to_vec(), vec![Range::new(1, u128::MAX - 1)]);
        assert!(s.give(u128::MAX));
        assert_eq!(s.last(), Some(u128::MAX));
    }
}
