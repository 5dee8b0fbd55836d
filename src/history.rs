//! Cluster genealogy across cutoff passes, and the retention selection
//! that picks one clustering per sub-tree.

use log::info;

use crate::constants::{LOCAL_ID_SPAN, MAX_CLUSTERS};
use crate::core::merge::MergeSet;
use crate::error::{Error, Result};

/// Retention verdict of one genealogy row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retain {
    Undecided,
    Yes,
    No,
}

/// One trimmed cluster of one pass.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub pass: u32,
    pub cutoff: f32,
    /// Dense canonical id within its pass.
    pub cluster: u32,
    /// Dense id of the previous-pass cluster this one descends from;
    /// zero when there is none.
    pub parent: u32,
    /// Dense id of the same-pass sibling this cluster was folded into
    /// during the following pass; zero while it survives.
    pub merged_into: u32,
    pub retain: Retain,
}

/// Grows monotonically over the sweep; frozen before selection.
#[derive(Debug, Default)]
pub struct Genealogy {
    entries: Vec<HistoryEntry>,
}

impl Genealogy {
    /// Appends one row per trimmed cluster of the pass just finished.
    ///
    /// The parent heuristic pairs clusters with the previous pass's rows
    /// in discovery order, skipping rows already folded into a sibling:
    /// cluster numbering is stable across passes (see the canonicalizer's
    /// scan order), so positional pairing tracks real descent.
    pub fn record_pass(
        &mut self,
        pass: u32,
        cutoff: f32,
        clusters: u32,
        prev_clusters: u32,
    ) -> Result<()> {
        if self.entries.len() + clusters as usize > MAX_CLUSTERS {
            return Err(Error::HistoryOverflow { max: MAX_CLUSTERS });
        }
        if pass == 0 {
            for cluster in 1..=clusters {
                self.entries.push(HistoryEntry {
                    pass,
                    cutoff,
                    cluster,
                    parent: 0,
                    merged_into: 0,
                    retain: Retain::Undecided,
                });
            }
            return Ok(());
        }

        let recorded = self.entries.len();
        let mut parent = 1u32;
        for cluster in 1..=clusters {
            let mut descend_from = 0;
            if parent <= prev_clusters {
                // Skip previous-pass clusters that were merged away; the
                // scan visits them in cluster order, so consecutive
                // merged parents fall through in one walk.
                for row in &self.entries[..recorded] {
                    if row.pass == pass - 1 && row.cluster == parent && row.merged_into != 0 {
                        parent += 1;
                    }
                }
                if parent <= prev_clusters {
                    descend_from = parent;
                }
                parent += 1;
            }
            self.entries.push(HistoryEntry {
                pass,
                cutoff,
                cluster,
                parent: descend_from,
                merged_into: 0,
                retain: Retain::Undecided,
            });
        }
        Ok(())
    }

    /// Marks previous-pass clusters that the pass now starting has folded
    /// together. Only requests whose `hi` falls inside the seeded
    /// worker-1 range of previously retained ids can name one.
    ///
    /// Returns whether any pre-existing cluster was merged; the sweep
    /// controller uses this to decide the sidecar naming.
    pub fn flag_merges(
        &mut self,
        pass: u32,
        merges: &MergeSet,
        prev_retained: Option<u32>,
    ) -> bool {
        let Some(prev_retained) = prev_retained else {
            return false;
        };
        let mut merging = false;
        for request in merges.iter() {
            if request.hi <= LOCAL_ID_SPAN + prev_retained {
                merging = true;
                let merged = request.hi - LOCAL_ID_SPAN;
                let into = request.lo - LOCAL_ID_SPAN;
                for row in &mut self.entries {
                    if row.pass + 1 == pass && row.cluster == merged {
                        row.merged_into = into;
                    }
                }
            }
        }
        merging
    }

    /// Decides retention for every row.
    ///
    /// A merged row (and the sibling it merged into) is retained unless
    /// an ancestor was already retained; rows of the final pass that are
    /// still undecided get the same ancestry check. Ancestry walks the
    /// `parent` chain through the most recent earlier row of each id.
    pub fn select(&mut self) {
        for at in 0..self.entries.len() {
            if self.entries[at].merged_into == 0 {
                continue;
            }
            self.entries[at].retain = self.ancestry_verdict(at, self.entries[at].parent);

            let pass = self.entries[at].pass;
            let target = self.entries[at].merged_into;
            if let Some(other) =
                (0..at).find(|&x| self.entries[x].pass == pass && self.entries[x].cluster == target)
            {
                self.entries[other].retain =
                    self.ancestry_verdict(other, self.entries[other].parent);
            }
        }

        let Some(last_pass) = self.entries.last().map(|row| row.pass) else {
            return;
        };
        for at in (0..self.entries.len()).rev() {
            if self.entries[at].pass != last_pass {
                break;
            }
            if self.entries[at].retain != Retain::Undecided {
                continue;
            }
            self.entries[at].retain = self.ancestry_verdict(at, self.entries[at].parent);
        }
    }

    /// Yes iff no ancestor of `cluster` (walking rows before `from`) has
    /// already been given a verdict.
    fn ancestry_verdict(&self, from: usize, cluster: u32) -> Retain {
        if cluster == 0 {
            return Retain::Yes;
        }
        for at in (0..from).rev() {
            if self.entries[at].cluster == cluster {
                if self.entries[at].retain != Retain::Undecided {
                    return Retain::No;
                }
                if self.entries[at].parent == 0 {
                    return Retain::Yes;
                }
                return self.ancestry_verdict(at, self.entries[at].parent);
            }
        }
        Retain::No
    }

    /// Rows selected for the final output, in recording order.
    pub fn retained(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().filter(|row| row.retain == Retain::Yes)
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The merging-history report behind the `-M` flag.
    pub fn print_table(&self) {
        for row in &self.entries {
            let verdict = match row.retain {
                Retain::Undecided => ' ',
                Retain::Yes => 'y',
                Retain::No => 'n',
            };
            info!(
                "{:4} {:6.2} | {:3} ^ {:3} -> {:3} | {}",
                row.pass, row.cutoff, row.cluster, row.parent, row.merged_into, verdict
            );
        }
    }
}
