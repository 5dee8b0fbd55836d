//! Applies the global merge set to the worker-prefixed id space and
//! compacts what survives into dense canonical ids.

use log::trace;

use crate::constants::LOCAL_ID_SPAN;
use crate::error::{Error, Result};

use super::merge::MergeSet;

// Table markers between phases. Real forwarded ids are worker-prefixed
// (>= LOCAL_ID_SPAN) or dense (assigned last), so the small values are
// free to carry status.
const KEPT: u32 = 0;
const ELIMINATED: u32 = 1;
const TOO_SMALL: u32 = 2;

/// Per-worker forwarding tables over one pass's local ids.
///
/// The same tables carry the pass through its phases: resolving merges,
/// marking merged-away ids, flagging undersized clusters, and handing
/// out dense canonical ids. Slot 0 of each table is unused (local
/// counters start at 1).
pub struct IdForwarder {
    tables: Vec<Vec<u32>>,
}

impl IdForwarder {
    /// Builds tables sized to each worker's final local count.
    pub fn new(local_counts: &[u32]) -> Result<Self> {
        let mut tables = Vec::with_capacity(local_counts.len());
        for (idx, &count) in local_counts.iter().enumerate() {
            if count >= LOCAL_ID_SPAN {
                return Err(Error::LocalIdOverflow {
                    worker: idx + 1,
                    count,
                    span: LOCAL_ID_SPAN,
                });
            }
            tables.push(vec![KEPT; count as usize + 1]);
        }
        Ok(IdForwarder { tables })
    }

    /// Applies the merge set to every assigned id.
    ///
    /// Requests are processed in descending `hi` order: once `hi`
    /// collapses into `lo`, no later request can name that `hi` on its
    /// left side, so one substitution pass over the tables suffices and
    /// no chain walking is ever needed.
    pub fn apply_merges(&mut self, merges: &MergeSet, ids: &mut [u32]) -> Result<()> {
        for (idx, table) in self.tables.iter_mut().enumerate() {
            let base = (idx as u32 + 1) * LOCAL_ID_SPAN;
            for (local, slot) in table.iter_mut().enumerate() {
                *slot = base + local as u32;
            }
        }
        for request in merges.iter().rev() {
            for table in &mut self.tables {
                for slot in table.iter_mut().skip(1) {
                    if *slot == request.hi {
                        *slot = request.lo;
                    }
                }
            }
        }
        for id in ids.iter_mut() {
            if *id > 0 {
                *id = self.forward(*id)?;
            }
        }
        for table in &mut self.tables {
            table.fill(KEPT);
        }
        Ok(())
    }

    /// Marks every merged-away id; no event still carries one after
    /// [`IdForwarder::apply_merges`], but the slot must not be handed a
    /// dense id later.
    pub fn mark_eliminated(&mut self, merges: &MergeSet) {
        for request in merges.iter().rev() {
            let (worker, local) = split(request.hi);
            if let Some(slot) = self.slot_mut(worker, local) {
                *slot = ELIMINATED;
            }
        }
    }

    /// Counts events per id and flags clusters under `min_events`.
    /// Returns how many clusters are large enough to keep.
    pub fn trim_small(&mut self, ids: &[u32], min_events: u32) -> u32 {
        let mut counts: Vec<Vec<u32>> =
            self.tables.iter().map(|table| vec![0; table.len()]).collect();
        for &id in ids {
            if id == 0 {
                continue;
            }
            let (worker, local) = split(id);
            if worker >= 1 && worker <= counts.len() && local < counts[worker - 1].len() {
                counts[worker - 1][local] += 1;
            }
        }
        let mut retained = 0;
        for (table, counts) in self.tables.iter_mut().zip(&counts) {
            for (slot, &count) in table.iter_mut().zip(counts).skip(1) {
                if count < min_events {
                    if *slot != ELIMINATED {
                        *slot = TOO_SMALL;
                    }
                } else {
                    retained += 1;
                }
            }
        }
        retained
    }

    /// Renumbers: kept clusters become `1..=retained` in worker-then-local
    /// scan order, undersized ones continue from `retained + 1`, and
    /// eliminated slots map to zero. Returns the highest id handed out,
    /// which seeds worker 1 on the next pass.
    ///
    /// The scan order is what keeps genealogy parents deterministic
    /// across passes; it must not change.
    pub fn assign_dense(&mut self, ids: &mut [u32], retained: u32) -> Result<u32> {
        let mut next = 1u32;
        let mut small = retained + 1;
        for (idx, table) in self.tables.iter_mut().enumerate() {
            for (local, slot) in table.iter_mut().enumerate().skip(1) {
                *slot = match *slot {
                    KEPT => {
                        let id = next;
                        trace!(
                            "renaming cluster {} to {id}",
                            (idx as u32 + 1) * LOCAL_ID_SPAN + local as u32
                        );
                        next += 1;
                        id
                    }
                    TOO_SMALL => {
                        let id = small;
                        small += 1;
                        id
                    }
                    _ => 0,
                };
            }
        }
        for id in ids.iter_mut() {
            if *id > 0 {
                *id = self.forward(*id)?;
            }
        }
        Ok(small - 1)
    }

    fn forward(&self, id: u32) -> Result<u32> {
        let (worker, local) = split(id);
        if worker == 0 || worker > self.tables.len() || local >= self.tables[worker - 1].len() {
            return Err(Error::IdOutOfRange { id });
        }
        Ok(self.tables[worker - 1][local])
    }

    fn slot_mut(&mut self, worker: usize, local: usize) -> Option<&mut u32> {
        if worker == 0 || worker > self.tables.len() {
            return None;
        }
        self.tables[worker - 1].get_mut(local)
    }
}

/// Splits a worker-prefixed id into `(worker_ordinal, local_counter)`.
fn split(id: u32) -> (usize, usize) {
    ((id / LOCAL_ID_SPAN) as usize, (id % LOCAL_ID_SPAN) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    const W1: u32 = LOCAL_ID_SPAN;
    const W2: u32 = 2 * LOCAL_ID_SPAN;

    #[test]
    fn merges_collapse_across_workers() {
        // Worker 1 minted ids 1..=2, worker 2 minted id 1; one cross
        // worker merge folds worker 2's cluster into worker 1's first.
        let mut merges = MergeSet::new();
        merges.insert(W1 + 1, W2 + 1);
        let mut ids = vec![W1 + 1, W1 + 1, W2 + 1, W2 + 1, W1 + 2, W1 + 2, 0];

        let mut fwd = IdForwarder::new(&[2, 1]).unwrap();
        fwd.apply_merges(&merges, &mut ids).unwrap();
        assert_eq!(ids, vec![W1 + 1, W1 + 1, W1 + 1, W1 + 1, W1 + 2, W1 + 2, 0]);

        fwd.mark_eliminated(&merges);
        let retained = fwd.trim_small(&ids, 2);
        assert_eq!(retained, 2);
        let first_avail = fwd.assign_dense(&mut ids, retained).unwrap();
        assert_eq!(ids, vec![1, 1, 1, 1, 2, 2, 0]);
        assert_eq!(first_avail, 2);
    }

    #[test]
    fn undersized_clusters_move_past_the_retained_range() {
        let mut ids = vec![W1 + 1, W1 + 1, W1 + 2, 0];
        let merges = MergeSet::new();
        let mut fwd = IdForwarder::new(&[2]).unwrap();
        fwd.apply_merges(&merges, &mut ids).unwrap();
        fwd.mark_eliminated(&merges);
        let retained = fwd.trim_small(&ids, 2);
        assert_eq!(retained, 1);
        let first_avail = fwd.assign_dense(&mut ids, retained).unwrap();
        // Cluster 1 kept its two events; the singleton is addressable
        // past the retained range instead of vanishing.
        assert_eq!(ids, vec![1, 1, 2, 0]);
        assert_eq!(first_avail, 2);
    }

    #[test]
    fn chained_merges_resolve_in_one_pass() {
        // 3 -> 2 and 2 -> 1 recorded as a sorted set; descending order
        // application must land every event on cluster 1.
        let mut merges = MergeSet::new();
        merges.insert(W1 + 2, W1 + 3);
        merges.insert(W1 + 1, W1 + 2);
        let mut ids = vec![W1 + 1, W1 + 2, W1 + 3];
        let mut fwd = IdForwarder::new(&[3]).unwrap();
        fwd.apply_merges(&merges, &mut ids).unwrap();
        assert_eq!(ids, vec![W1 + 1, W1 + 1, W1 + 1]);
    }

    #[test]
    fn dense_ids_form_a_contiguous_range() {
        let mut ids: Vec<u32> = (1..=5).flat_map(|j| vec![W1 + j; 3]).collect();
        let merges = MergeSet::new();
        let mut fwd = IdForwarder::new(&[5]).unwrap();
        fwd.apply_merges(&merges, &mut ids).unwrap();
        fwd.mark_eliminated(&merges);
        let retained = fwd.trim_small(&ids, 3);
        assert_eq!(retained, 5);
        fwd.assign_dense(&mut ids, retained).unwrap();
        let mut seen: Vec<u32> = ids.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn out_of_range_ids_are_a_consistency_error() {
        let merges = MergeSet::new();
        let mut fwd = IdForwarder::new(&[1]).unwrap();
        let mut ids = vec![W2 + 1];
        assert!(fwd.apply_merges(&merges, &mut ids).is_err());
    }
}
