//! The distributed neighbor-joining engine.
//!
//! One coordinator drives a set of workers over disjoint block pairs of
//! the event table. Workers assign worker-prefixed local cluster ids and
//! accumulate merge requests; a tree reduction folds the per-worker
//! request sets into one; the canonicalizer applies the merges and
//! renumbers the surviving clusters densely.

pub mod canonical;
pub mod coordinator;
pub mod distance;
pub mod merge;
pub mod message;
pub mod worker;

pub use canonical::IdForwarder;
pub use coordinator::{Engine, PassOutcome};
pub use merge::{MergeRequest, MergeSet};

use crate::dataset::EventTable;

/// A rectangular sub-matrix of the event-pair matrix, upper-triangular
/// with respect to row indices (`ii <= jj`). The diagonal blocks pair a
/// row range against itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPair {
    pub ii: usize,
    pub jj: usize,
    pub ii_last: usize,
    pub jj_last: usize,
}

impl BlockPair {
    pub fn is_diagonal(&self) -> bool {
        self.ii == self.jj
    }

    /// Whether the sort-key gap between the two row ranges already rules
    /// out every cross pair.
    ///
    /// The table is sorted by the sort key, so the smallest per-column
    /// difference any cross pair can have is the gap between the last row
    /// of the `ii` range and the first row of the `jj` range; if that gap
    /// squared exceeds the cutoff the whole block pair is dead.
    pub fn sort_gap_exceeds(&self, table: &EventTable, test_dist: u64) -> bool {
        if self.is_diagonal() {
            return false;
        }
        let vi = table.sort_value(self.ii_last - 1);
        let vj = table.sort_value(self.jj);
        if vj > vi {
            let gap = u64::from(vj - vi);
            return gap * gap > test_dist;
        }
        false
    }
}

/// The squared cutoff a pass tests against: `d² · C`, truncated the way
/// every producer of these files truncates it.
pub fn squared_cutoff(cutoff: f32, cols: usize) -> u64 {
    (cutoff * cutoff * cols as f32) as u64
}
