//! Nearest-cluster reassignment: re-attaches events the retention
//! selection left behind, and the leftover events excluded at ingest.

use rayon::prelude::*;

use crate::core::distance::squared_distance;
use crate::dataset::EventTable;

/// Marks an event awaiting re-attachment. Above any legal canonical id,
/// so flagged events can never be mistaken for assigned sources.
const REASSIGN: u32 = 9_999_999;

/// Flags events that carried a cluster at the final pass but lost it to
/// retention selection. Returns how many were flagged.
pub fn flag_lost_events(ids: &mut [u32], final_pass: &[u32]) -> usize {
    let mut flagged = 0;
    for (id, &was) in ids.iter_mut().zip(final_pass) {
        if was != 0 && *id == 0 {
            *id = REASSIGN;
            flagged += 1;
        }
    }
    flagged
}

/// Attaches every flagged event to the cluster of its nearest assigned
/// event, whatever the distance. An exact tie between two different
/// clusters leaves the event unassigned.
///
/// The scan runs against a snapshot taken before any re-attachment, so a
/// reassigned event never serves as the source for another; running the
/// whole operation twice from the same state yields the same ids.
///
/// Work is split into `parties` equal chunks of the event range.
pub fn attach_unassigned(table: &EventTable, ids: &mut [u32], max_cluster: u32, parties: usize) {
    let source = ids.to_vec();
    let chunk = 1 + table.len() / parties;
    ids.par_chunks_mut(chunk).enumerate().for_each(|(index, ids)| {
        let offset = index * chunk;
        for (at, id) in ids.iter_mut().enumerate() {
            if *id != REASSIGN {
                continue;
            }
            *id = match nearest(table, &source, max_cluster, table.row(offset + at)) {
                Nearest::Cluster(cluster, _) => cluster,
                Nearest::Ambiguous | Nearest::None => 0,
            };
        }
    });
}

/// Attaches leftover events to the nearest assigned event, accepting
/// only matches within the extended cutoff. Returns one cluster id per
/// leftover row, zero meaning ambiguous or out of range.
pub fn attach_leftover(
    table: &EventTable,
    ids: &[u32],
    max_cluster: u32,
    leftover: &[u16],
    test_ext: u64,
    parties: usize,
) -> Vec<u32> {
    let cols = table.cols();
    let rows = leftover.len() / cols;
    let mut clusters = vec![0u32; rows];
    let chunk = 1 + rows / parties;
    clusters.par_chunks_mut(chunk).enumerate().for_each(|(index, out)| {
        let offset = index * chunk;
        for (at, slot) in out.iter_mut().enumerate() {
            let row = offset + at;
            let query = &leftover[row * cols..(row + 1) * cols];
            if let Nearest::Cluster(cluster, d) = nearest(table, ids, max_cluster, query) {
                if d <= test_ext {
                    *slot = cluster;
                }
            }
        }
    });
    clusters
}

enum Nearest {
    Cluster(u32, u64),
    Ambiguous,
    None,
}

/// Fused arg-min over every assigned event, tracking whether the current
/// minimum is shared by two different clusters.
fn nearest(table: &EventTable, ids: &[u32], max_cluster: u32, query: &[u16]) -> Nearest {
    let mut best = u64::MAX;
    let mut best_at = None;
    let mut ambiguous = false;
    for (j, &id) in ids.iter().enumerate() {
        if id == 0 || id > max_cluster {
            continue;
        }
        let d = squared_distance(table.row(j), query);
        if d < best {
            best = d;
            best_at = Some(j);
            ambiguous = false;
        } else if d == best {
            if let Some(at) = best_at {
                if ids[at] != id {
                    ambiguous = true;
                }
            }
        }
    }
    if ambiguous {
        Nearest::Ambiguous
    } else if let Some(at) = best_at {
        Nearest::Cluster(ids[at], best)
    } else {
        Nearest::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::EventTable;

    fn table(points: &[[u16; 4]]) -> EventTable {
        let rows = points.iter().enumerate().map(|(i, p)| (i as u32, p.to_vec())).collect();
        EventTable::from_rows(4, 0, rows).unwrap()
    }

    #[test]
    fn lost_events_reattach_to_the_nearest_cluster() {
        // Two clusters and one stray event much closer to the first.
        let t = table(&[
            [10, 10, 0, 0],
            [11, 10, 0, 0],
            [14, 10, 0, 0],
            [100, 100, 0, 0],
            [101, 100, 0, 0],
        ]);
        let mut ids = vec![1, 1, 0, 2, 2];
        let final_pass = vec![1, 1, 5, 2, 2];
        assert_eq!(flag_lost_events(&mut ids, &final_pass), 1);
        attach_unassigned(&t, &mut ids, 2, 3);
        assert_eq!(ids, vec![1, 1, 1, 2, 2]);
    }

    #[test]
    fn exact_ties_stay_unassigned() {
        // The middle event sits exactly between both clusters.
        let t = table(&[
            [10, 0, 0, 0],
            [20, 0, 0, 0],
            [30, 0, 0, 0],
        ]);
        let mut ids = vec![1, 0, 2];
        let final_pass = vec![1, 9, 2];
        assert_eq!(flag_lost_events(&mut ids, &final_pass), 1);
        attach_unassigned(&t, &mut ids, 2, 2);
        assert_eq!(ids, vec![1, 0, 2]);
    }

    #[test]
    fn reattachment_is_deterministic() {
        let t = table(&[
            [10, 0, 0, 0],
            [12, 0, 0, 0],
            [27, 0, 0, 0],
            [40, 0, 0, 0],
            [41, 0, 0, 0],
        ]);
        let start = vec![1, 1, 0, 2, 2];
        let final_pass = vec![1, 1, 7, 2, 2];

        let mut once = start.clone();
        flag_lost_events(&mut once, &final_pass);
        attach_unassigned(&t, &mut once, 2, 2);

        let mut twice = start;
        flag_lost_events(&mut twice, &final_pass);
        attach_unassigned(&t, &mut twice, 2, 2);

        assert_eq!(once, twice);
        // And a second full run over the already-attached state changes
        // nothing: every event is either assigned or tied.
        let mut again = once.clone();
        flag_lost_events(&mut again, &final_pass);
        attach_unassigned(&t, &mut again, 2, 2);
        assert_eq!(again, once);
    }

    #[test]
    fn leftover_events_respect_the_extended_cutoff() {
        let t = table(&[
            [10, 0, 0, 0],
            [11, 0, 0, 0],
            [50, 0, 0, 0],
            [51, 0, 0, 0],
        ]);
        let ids = vec![1, 1, 2, 2];
        // One leftover near cluster 1, one far from everything.
        let leftover: Vec<u16> = vec![12, 0, 0, 0, 1000, 0, 0, 0];
        let clusters = attach_leftover(&t, &ids, 2, &leftover, 100, 2);
        assert_eq!(clusters, vec![1, 0]);
    }
}
