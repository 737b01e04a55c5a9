//! Static interval index, for "which ranges contain this point" queries.
//!
//! The index is built once (all ranges known upfront), then only queried,
//! which allows storing it as an implicit balanced tree over the records
//! sorted by their left endpoint, each subtree annotated with the largest
//! right endpoint it contains (i.e. an "augmented" interval tree, without
//! any per-node allocations).

use smallvec::SmallVec;
use std::ops::RangeInclusive;

/// One `(range, payload)` record, with `range` being non-empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntervalRecord<P> {
    pub left: i64,
    pub right: i64,
    pub payload: P,
}

impl<P> IntervalRecord<P> {
    pub fn contains(&self, point: i64) -> bool {
        self.left <= point && point <= self.right
    }
}

/// Collects records, before `build`ing them into an `IntervalIndex`.
pub struct IntervalIndexBuilder<P> {
    records: Vec<IntervalRecord<P>>,
}

impl<P> Default for IntervalIndexBuilder<P> {
    fn default() -> Self {
        Self { records: vec![] }
    }
}

impl<P> IntervalIndexBuilder<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record (overlapping or even identical ranges are allowed).
    #[track_caller]
    pub fn insert(&mut self, range: RangeInclusive<i64>, payload: P) {
        let (left, right) = range.into_inner();
        assert!(left <= right, "interval: empty range {left}..={right}");
        self.records.push(IntervalRecord {
            left,
            right,
            payload,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn build(mut self) -> IntervalIndex<P> {
        // Stable, so records with identical ranges stay in insertion order.
        self.records.sort_by_key(|r| (r.left, r.right));

        let mut max_right = vec![i64::MIN; self.records.len()];
        IntervalIndex::compute_max_right(&self.records, &mut max_right, 0, self.records.len());

        IntervalIndex {
            records: self.records,
            max_right,
        }
    }
}

/// Immutable interval index (see the module docs).
pub struct IntervalIndex<P> {
    /// All records, sorted by `(left, right)`.
    records: Vec<IntervalRecord<P>>,

    /// For the subtree rooted at `mid` of each range `lo..hi` (with `mid` being
    /// `lo + (hi - lo) / 2`), the largest `right` endpoint in `lo..hi`.
    max_right: Vec<i64>,
}

impl<P> IntervalIndex<P> {
    fn compute_max_right(
        records: &[IntervalRecord<P>],
        max_right: &mut [i64],
        lo: usize,
        hi: usize,
    ) -> i64 {
        if lo >= hi {
            return i64::MIN;
        }
        let mid = lo + (hi - lo) / 2;
        let max = records[mid]
            .right
            .max(Self::compute_max_right(records, max_right, lo, mid))
            .max(Self::compute_max_right(records, max_right, mid + 1, hi));
        max_right[mid] = max;
        max
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, sorted by their `(left, right)` endpoints.
    pub fn records(&self) -> &[IntervalRecord<P>] {
        &self.records
    }

    /// All records whose range contains `point`, sorted by `(left, right)`.
    pub fn query(&self, point: i64) -> SmallVec<[&IntervalRecord<P>; 4]> {
        let mut found = SmallVec::new();
        self.query_in(point, 0, self.records.len(), &mut found);
        found
    }

    fn query_in<'a>(
        &'a self,
        point: i64,
        lo: usize,
        hi: usize,
        found: &mut SmallVec<[&'a IntervalRecord<P>; 4]>,
    ) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        if self.max_right[mid] < point {
            return;
        }

        // In-order traversal, to keep results sorted.
        self.query_in(point, lo, mid, found);

        let record = &self.records[mid];
        if record.left > point {
            // Everything to the right starts even later.
            return;
        }
        if record.contains(point) {
            found.push(record);
        }
        self.query_in(point, mid + 1, hi, found);
    }
}
