// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Free-unit bookkeeping for one address range.
//!
//! A unit is either a single address or, with aggregation configured, one
//! aggregation block. Units are numbered by `address_bits >> shift`, so the
//! units of a range form one contiguous interval.

use std::{cmp::Ordering, fmt};

use thiserror::Error;

/// An inclusive interval of unit numbers.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub(crate) struct Span {
    pub(crate) first: u128,
    pub(crate) last: u128,
}

impl Span {
    pub(crate) fn new(first: u128, last: u128) -> Self {
        debug_assert!(first <= last);
        Self { first, last }
    }

    fn compare(&self, unit: u128) -> Ordering {
        if self.first > unit {
            Ordering::Greater
        } else if self.last < unit {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }

    /// Number of units in the span. Never called on a span covering all of
    /// `u128`, such ranges are rejected when the pool is parsed.
    pub(crate) fn len(&self) -> u128 {
        self.last - self.first + 1
    }
}

/// Errors raised by [UnitSet] mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum UnitSetError {
    #[error("unit {0} outside of range")]
    OutOfBounds(u128),
    #[error("unit {0} already free")]
    AlreadyFree(u128),
    #[error("unit {0} not free")]
    NotFree(u128),
}

/// The free units of one range.
// Impl Note:
// `free` holds sorted, disjoint and non-adjacent spans.
// On assignment - the unit is taken out of its span (splitting it if needed).
// On release    - the unit is put back and merged with its neighbours.
#[derive(Debug, Eq, PartialEq, Clone)]
pub(crate) struct UnitSet {
    bounds: Span,
    free: Vec<Span>,
}

impl UnitSet {
    /// A set where every unit between `first` and `last` (inclusive) is free.
    pub(crate) fn new(first: u128, last: u128) -> Self {
        let bounds = Span::new(first, last);
        Self {
            bounds,
            free: vec![bounds],
        }
    }

    /// Total number of units, free or not.
    pub(crate) fn capacity(&self) -> u128 {
        self.bounds.len()
    }

    /// Number of free units.
    pub(crate) fn len(&self) -> u128 {
        self.free.iter().map(Span::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// The lowest free unit.
    pub(crate) fn first(&self) -> Option<u128> {
        self.free.first().map(|span| span.first)
    }

    pub(crate) fn contains(&self, unit: u128) -> bool {
        self.free
            .binary_search_by(|span| span.compare(unit))
            .is_ok()
    }

    /// Marks `unit` as used.
    pub(crate) fn take(&mut self, unit: u128) -> Result<(), UnitSetError> {
        if self.bounds.compare(unit) != Ordering::Equal {
            return Err(UnitSetError::OutOfBounds(unit));
        }
        let i = self
            .free
            .binary_search_by(|span| span.compare(unit))
            .map_err(|_| UnitSetError::NotFree(unit))?;

        let span = self.free[i];
        if span.first == span.last {
            self.free.remove(i);
        } else if span.first == unit {
            self.free[i].first = unit + 1;
        } else if span.last == unit {
            self.free[i].last = unit - 1;
        } else {
            // split in two around the taken unit
            self.free[i].first = unit + 1;
            self.free.insert(i, Span::new(span.first, unit - 1));
        }
        Ok(())
    }

    /// Marks `unit` as free again.
    pub(crate) fn put(&mut self, unit: u128) -> Result<(), UnitSetError> {
        if self.bounds.compare(unit) != Ordering::Equal {
            return Err(UnitSetError::OutOfBounds(unit));
        }
        let i = match self.free.binary_search_by(|span| span.compare(unit)) {
            Ok(_) => return Err(UnitSetError::AlreadyFree(unit)),
            Err(i) => i,
        };
        // free[i - 1].last < unit < free[i].first, so neither `+ 1` overflows.
        let joins_prev = i > 0 && self.free[i - 1].last + 1 == unit;
        let joins_next = i < self.free.len() && unit + 1 == self.free[i].first;

        match (joins_prev, joins_next) {
            (true, true) => {
                self.free[i - 1].last = self.free[i].last;
                self.free.remove(i);
            }
            (true, false) => self.free[i - 1].last = unit,
            (false, true) => self.free[i].first = unit,
            (false, false) => self.free.insert(i, Span::new(unit, unit)),
        }
        Ok(())
    }

    /// The free spans, lowest first.
    #[cfg(test)]
    pub(crate) fn spans(&self) -> &[Span] {
        &self.free
    }
}

impl fmt::Display for UnitSet {
    // Format the free units as [first-last, first-last, ...]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, span) in self.free.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}-{}", span.first, span.last)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, seq::SliceRandom};
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn check_invariants(set: &UnitSet) {
        for span in set.spans() {
            assert!(span.first <= span.last, "invalid span: {span:?}");
            assert!(span.first >= set.bounds.first && span.last <= set.bounds.last);
        }
        for pair in set.spans().windows(2) {
            // a gap of at least one used unit separates neighbouring spans
            assert!(
                pair[0].last + 1 < pair[1].first,
                "spans not ordered or not merged: {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn take_splits_and_put_merges() {
        let mut set = UnitSet::new(1, 10);

        set.take(5).unwrap();
        check_invariants(&set);
        assert_eq!(set.spans(), &[Span::new(1, 4), Span::new(6, 10)]);

        set.take(1).unwrap();
        set.take(10).unwrap();
        check_invariants(&set);
        assert_eq!(set.spans(), &[Span::new(2, 4), Span::new(6, 9)]);
        assert_eq!(set.len(), 7);
        assert_eq!(set.first(), Some(2));

        set.put(5).unwrap();
        check_invariants(&set);
        assert_eq!(set.spans(), &[Span::new(2, 9)]);

        set.put(1).unwrap();
        set.put(10).unwrap();
        assert_eq!(set.spans(), &[Span::new(1, 10)]);
        assert_eq!(set.to_string(), "[1-10]");
    }

    #[test]
    fn rejects_invalid_mutations() {
        let mut set = UnitSet::new(100, 103);

        assert_eq!(set.take(99), Err(UnitSetError::OutOfBounds(99)));
        assert_eq!(set.put(104), Err(UnitSetError::OutOfBounds(104)));
        assert_eq!(set.put(100), Err(UnitSetError::AlreadyFree(100)));

        set.take(100).unwrap();
        assert_eq!(set.take(100), Err(UnitSetError::NotFree(100)));
        assert!(!set.contains(100));
        assert!(set.contains(101));
    }

    #[test]
    fn upper_end_of_address_space() {
        let mut set = UnitSet::new(u128::MAX - 3, u128::MAX);

        set.take(u128::MAX).unwrap();
        assert_eq!(set.first(), Some(u128::MAX - 3));
        set.put(u128::MAX).unwrap();
        assert_eq!(set.spans(), &[Span::new(u128::MAX - 3, u128::MAX)]);
        assert_eq!(set.capacity(), 4);
    }

    #[test]
    fn drains_and_refills_in_random_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut set = UnitSet::new(1000, 1999);

        let mut units: Vec<u128> = (1000..2000).collect();
        units.shuffle(&mut rng);

        for (taken, unit) in units.iter().enumerate() {
            set.take(*unit).expect("unit should be free");
            check_invariants(&set);
            assert_eq!(set.len(), 1000 - taken as u128 - 1);
        }
        assert!(set.is_empty());
        assert_eq!(set.first(), None);

        units.shuffle(&mut rng);
        for unit in &units {
            set.put(*unit).expect("unit should be used");
            check_invariants(&set);
            // the lowest free unit is always reported first
            let lowest = set.spans()[0].first;
            assert_eq!(set.first(), Some(lowest));
            let probe = rng.random_range(1000..2000u128);
            assert_eq!(
                set.contains(probe),
                set.spans().iter().any(|s| s.first <= probe && probe <= s.last)
            );
        }
        assert_eq!(set.spans(), &[Span::new(1000, 1999)]);
    }
}
