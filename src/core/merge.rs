//! Sorted, deduplicated accumulation of cluster-merge intents.

use log::warn;

use crate::constants::MAX_MERGE_REQUESTS;

/// An intent to fold cluster `hi` into cluster `lo`. Always `lo < hi`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeRequest {
    pub lo: u32,
    pub hi: u32,
}

/// A bounded set of [`MergeRequest`]s, kept sorted by `hi` then `lo` with
/// no duplicates.
///
/// At most one request exists per `hi`: when a second request names an
/// already-present `hi` with a different `lo`, the set keeps the smaller
/// id on the left and re-inserts the two left-hand ids as a fresh request,
/// so transitive intent is preserved without ever recording a conflict.
///
/// The set is bounded; inserts past the bound are counted and dropped,
/// which can only under-merge and therefore over-cluster the pass. The
/// first drop is logged.
#[derive(Debug)]
pub struct MergeSet {
    pairs: Vec<MergeRequest>,
    limit: usize,
    dropped: u64,
}

impl Default for MergeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeSet {
    pub fn new() -> Self {
        Self::with_limit(MAX_MERGE_REQUESTS)
    }

    /// A set with a non-default bound. Production code uses [`MergeSet::new`];
    /// the small bound is for exercising the lossy path.
    pub fn with_limit(limit: usize) -> Self {
        MergeSet { pairs: Vec::new(), limit, dropped: 0 }
    }

    /// Records the intent to fold `hi` into `lo`. Idempotent.
    pub fn insert(&mut self, lo: u32, hi: u32) {
        debug_assert!(lo < hi, "merge request must order its ids");
        debug_assert!(lo > 0, "cluster ids are non-zero");

        if self.pairs.len() >= self.limit {
            self.drop_one();
            return;
        }

        // All requests for smaller `hi` values sit strictly before this
        // position; at most one entry can carry `hi` itself.
        let at = self.pairs.partition_point(|p| p.hi < hi);
        if at < self.pairs.len() {
            let found = self.pairs[at];
            if found.hi == hi {
                if found.lo == lo {
                    return;
                }
                return if found.lo > lo {
                    self.pairs[at].lo = lo;
                    self.insert(lo, found.lo)
                } else {
                    self.insert(found.lo, lo)
                };
            }
        }
        self.pairs.insert(at, MergeRequest { lo, hi });
    }

    /// Folds another sorted set into this one.
    ///
    /// Walks both sets in order, carrying the last insertion position as a
    /// scan hint, so the common case costs one pass over both lists.
    pub fn absorb(&mut self, other: &MergeSet) {
        self.dropped += other.dropped;
        let mut hint = 0;
        for &MergeRequest { lo, hi } in &other.pairs {
            self.insert_from(&mut hint, lo, hi);
        }
    }

    fn insert_from(&mut self, hint: &mut usize, lo: u32, hi: u32) {
        if self.pairs.len() >= self.limit {
            self.drop_one();
            return;
        }
        let mut at = *hint;
        while at < self.pairs.len() {
            let found = self.pairs[at];
            if found.hi > hi {
                break;
            }
            if found.hi == hi {
                if found.lo == lo {
                    return;
                }
                return if found.lo > lo {
                    self.pairs[at].lo = lo;
                    self.insert(lo, found.lo)
                } else {
                    self.insert(found.lo, lo)
                };
            }
            at += 1;
        }
        self.pairs.insert(at, MergeRequest { lo, hi });
        *hint = at;
    }

    fn drop_one(&mut self) {
        if self.dropped == 0 {
            warn!(
                "too many merge requests (max {}); further requests are dropped \
                 and this pass may over-cluster",
                self.limit
            );
        }
        self.dropped += 1;
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// How many inserts were lost to the capacity bound.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Requests in `(hi, lo)` order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = MergeRequest> + '_ {
        self.pairs.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_strictly_sorted(set: &MergeSet) {
        let pairs: Vec<_> = set.iter().collect();
        for w in pairs.windows(2) {
            assert!(
                (w[0].hi, w[0].lo) < (w[1].hi, w[1].lo),
                "set must stay strictly sorted: {pairs:?}"
            );
        }
        for p in &pairs {
            assert!(p.lo < p.hi);
        }
    }

    #[test]
    fn insert_is_idempotent_and_sorted() {
        let mut set = MergeSet::new();
        set.insert(3, 9);
        set.insert(1, 5);
        set.insert(3, 9);
        set.insert(1, 5);
        assert_eq!(set.len(), 2);
        assert_strictly_sorted(&set);
        let pairs: Vec<_> = set.iter().collect();
        assert_eq!(pairs[0], MergeRequest { lo: 1, hi: 5 });
        assert_eq!(pairs[1], MergeRequest { lo: 3, hi: 9 });
    }

    #[test]
    fn conflicting_targets_normalize() {
        let mut set = MergeSet::new();
        set.insert(2, 9);
        // A second request for 9 with a smaller winner: 9 keeps the
        // smaller left id and (1, 2) carries the transitive intent.
        set.insert(1, 9);
        let pairs: Vec<_> = set.iter().collect();
        assert_eq!(pairs, vec![MergeRequest { lo: 1, hi: 2 }, MergeRequest { lo: 1, hi: 9 }]);
        assert_strictly_sorted(&set);

        // And in the other direction.
        let mut set = MergeSet::new();
        set.insert(1, 9);
        set.insert(2, 9);
        let pairs: Vec<_> = set.iter().collect();
        assert_eq!(pairs, vec![MergeRequest { lo: 1, hi: 2 }, MergeRequest { lo: 1, hi: 9 }]);
    }

    #[test]
    fn absorb_merges_two_sorted_sets() {
        let mut a = MergeSet::new();
        a.insert(1, 4);
        a.insert(2, 8);
        let mut b = MergeSet::new();
        b.insert(1, 4);
        b.insert(3, 8);
        b.insert(5, 9);
        a.absorb(&b);
        assert_strictly_sorted(&a);
        let pairs: Vec<_> = a.iter().collect();
        assert_eq!(
            pairs,
            vec![
                MergeRequest { lo: 2, hi: 3 },
                MergeRequest { lo: 1, hi: 4 },
                MergeRequest { lo: 2, hi: 8 },
                MergeRequest { lo: 5, hi: 9 },
            ]
        );
    }

    #[test]
    fn overflow_is_counted_not_fatal() {
        let mut set = MergeSet::with_limit(2);
        set.insert(1, 4);
        set.insert(2, 5);
        set.insert(3, 6);
        set.insert(3, 7);
        assert_eq!(set.len(), 2);
        assert_eq!(set.dropped(), 2);
    }
}
