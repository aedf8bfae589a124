//! Closed integer ranges over a scalar domain

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar value usable as an interval endpoint
///
/// Implemented for the unsigned widths used by the pools: `u64` for
/// integer ids and `u128` for IP addresses treated as big integers.
pub trait Scalar: Copy + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Smallest representable value
    const MIN: Self;
    /// Largest representable value
    const MAX: Self;

    /// `self + 1`, or `None` at the top of the domain
    fn successor(self) -> Option<Self>;

    /// `self - 1`, or `None` at the bottom of the domain
    fn predecessor(self) -> Option<Self>;

    /// Number of values in `[lo, hi]`, saturating at `u128::MAX`
    fn span(lo: Self, hi: Self) -> u128;
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {
                const MIN: Self = <$t>::MIN;
                const MAX: Self = <$t>::MAX;

                fn successor(self) -> Option<Self> {
                    self.checked_add(1)
                }

                fn predecessor(self) -> Option<Self> {
                    self.checked_sub(1)
                }

                fn span(lo: Self, hi: Self) -> u128 {
                    ((hi - lo) as u128).saturating_add(1)
                }
            }
        )*
    };
}

impl_scalar!(u32, u64, u128);

/// A closed interval `[start, end]`
///
/// Construction normalizes swapped bounds so `start <= end` always holds.
/// Ranges order by `start`, then by `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RangeRepr<T>", bound(deserialize = "T: Scalar + Deserialize<'de>"))]
pub struct Range<T: Scalar> {
    start: T,
    end: T,
}

#[derive(Deserialize)]
struct RangeRepr<T> {
    start: T,
    end: T,
}

impl<T: Scalar> From<RangeRepr<T>> for Range<T> {
    fn from(repr: RangeRepr<T>) -> Self {
        Range::new(repr.start, repr.end)
    }
}

impl<T: Scalar> Range<T> {
    /// Create a range, swapping the bounds if given in reverse
    pub fn new(a: T, b: T) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    /// Single-value range `[v, v]`
    pub fn single(v: T) -> Self {
        Self { start: v, end: v }
    }

    pub fn start(&self) -> T {
        self.start
    }

    pub fn end(&self) -> T {
        self.end
    }

    /// Number of values in the range (saturating)
    pub fn len(&self) -> u128 {
        T::span(self.start, self.end)
    }

    /// Ranges are never empty; provided for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, v: T) -> bool {
        self.start <= v && v <= self.end
    }

    pub fn contains_range(&self, other: &Range<T>) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn is_disjoint(&self, other: &Range<T>) -> bool {
        self.end < other.start || self.start > other.end
    }

    pub fn overlaps(&self, other: &Range<T>) -> bool {
        !self.is_disjoint(other)
    }

    /// True when the ranges touch without sharing a value
    pub fn is_adjacent_to(&self, other: &Range<T>) -> bool {
        self.end.successor() == Some(other.start) || other.end.successor() == Some(self.start)
    }

    /// Smallest range covering both, valid when they overlap or are adjacent
    pub fn union(&self, other: &Range<T>) -> Range<T> {
        Range {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Parts of `self` not covered by `other` (zero, one or two ranges)
    pub fn difference(&self, other: &Range<T>) -> Vec<Range<T>> {
        if self.is_disjoint(other) {
            return vec![*self];
        }

        let mut parts = Vec::with_capacity(2);
        if self.start < other.start {
            if let Some(below) = other.start.predecessor() {
                parts.push(Range::new(self.start, below));
            }
        }
        if other.end < self.end {
            if let Some(above) = other.end.successor() {
                parts.push(Range::new(above, self.end));
            }
        }
        parts
    }
}

impl<T: Scalar> fmt::Display for Range<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}
