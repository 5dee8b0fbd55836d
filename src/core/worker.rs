//! The block worker: enumerates cross pairs of one block pair at a time,
//! assigning and unifying cluster ids locally.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::error;

use crate::constants::LOCAL_ID_SPAN;
use crate::dataset::EventTable;
use crate::error::{Error, Result};

use super::distance::squared_distance_capped;
use super::merge::MergeSet;
use super::message::{Reply, ToWorker, WorkerChannels};
use super::BlockPair;

/// Spawns one worker thread. It runs until it receives `Shutdown` or its
/// coordinator goes away.
pub fn spawn(
    ordinal: usize,
    table: Arc<EventTable>,
    channels: WorkerChannels,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("dclust-worker-{ordinal}"))
        .spawn(move || Worker::new(ordinal, table, channels).run())
        .map_err(Error::Spawn)
}

struct Worker {
    ordinal: usize,
    table: Arc<EventTable>,
    channels: WorkerChannels,
    /// This worker's copy of the cluster-id vector. Only the slices of
    /// the current assignment are ever current; everything else is stale
    /// between assignments.
    ids: Vec<u32>,
    /// Merge requests accumulated across all assignments of the pass.
    merges: MergeSet,
    /// Absolute local-id counter, pre-offset by the worker ordinal.
    counter: u32,
}

impl Worker {
    fn new(ordinal: usize, table: Arc<EventTable>, channels: WorkerChannels) -> Self {
        let len = table.len();
        Worker {
            ordinal,
            table,
            channels,
            ids: vec![0; len],
            merges: MergeSet::new(),
            counter: 0,
        }
    }

    fn run(mut self) {
        loop {
            match self.channels.commands.recv() {
                Ok(ToWorker::BeginPass { test_dist, seed }) => {
                    if !self.run_pass(test_dist, seed) {
                        return;
                    }
                }
                Ok(ToWorker::Shutdown) | Err(_) => return,
                Ok(msg) => {
                    error!("worker {}: unexpected {msg:?} between passes", self.ordinal);
                    return;
                }
            }
        }
    }

    /// One full pass. Returns false when the worker should exit.
    fn run_pass(&mut self, test_dist: u64, seed: u32) -> bool {
        self.ids.fill(0);
        self.merges = MergeSet::new();
        self.counter = self.ordinal as u32 * LOCAL_ID_SPAN + seed;

        // Assignments until the coordinator drains us.
        loop {
            match self.channels.commands.recv() {
                Ok(ToWorker::Assign(block)) => {
                    if !self.receive_slices(block) {
                        return false;
                    }
                    self.compute(block, test_dist);
                    if self.channels.done.send(self.ordinal).is_err() {
                        return false;
                    }
                    if !self.return_slices(block) {
                        return false;
                    }
                }
                Ok(ToWorker::Drain) => {
                    if self.channels.replies.send(Reply::FinalCount(self.counter)).is_err() {
                        return false;
                    }
                    break;
                }
                Ok(ToWorker::Shutdown) | Err(_) => return false,
                Ok(msg) => {
                    error!("worker {}: unexpected {msg:?} while computing", self.ordinal);
                    return false;
                }
            }
        }

        // Merge-set tree reduction: obey join orders until the
        // coordinator ends the reduction.
        loop {
            match self.channels.commands.recv() {
                Ok(ToWorker::Join(order)) if order.from == 0 => break,
                Ok(ToWorker::Join(order)) if order.from == self.ordinal => {
                    let set = std::mem::take(&mut self.merges);
                    if self.channels.peers[order.to - 1].send(ToWorker::MergeSet(set)).is_err() {
                        return false;
                    }
                }
                Ok(ToWorker::Join(_)) => {
                    match self.channels.commands.recv() {
                        Ok(ToWorker::MergeSet(set)) => self.merges.absorb(&set),
                        _ => return false,
                    }
                    if self.channels.replies.send(Reply::Joined).is_err() {
                        return false;
                    }
                }
                Ok(ToWorker::Shutdown) | Err(_) => return false,
                Ok(msg) => {
                    error!("worker {}: unexpected {msg:?} while joining", self.ordinal);
                    return false;
                }
            }
        }

        // Worker 1 holds the fully reduced set.
        if self.ordinal == 1 {
            let set = std::mem::take(&mut self.merges);
            if self.channels.replies.send(Reply::MergeSet(set)).is_err() {
                return false;
            }
        }
        true
    }

    fn receive_slices(&mut self, block: BlockPair) -> bool {
        let expected = if block.is_diagonal() { 1 } else { 2 };
        for _ in 0..expected {
            match self.channels.commands.recv() {
                Ok(ToWorker::Slice { start, ids }) => {
                    self.ids[start..start + ids.len()].copy_from_slice(&ids);
                }
                _ => return false,
            }
        }
        true
    }

    fn return_slices(&self, block: BlockPair) -> bool {
        let send = |start: usize, end: usize| {
            self.channels
                .replies
                .send(Reply::Slice { start, ids: self.ids[start..end].to_vec() })
                .is_ok()
        };
        if !send(block.ii, block.ii_last) {
            return false;
        }
        if !block.is_diagonal() && !send(block.jj, block.jj_last) {
            return false;
        }
        true
    }

    fn compute(&mut self, block: BlockPair, test_dist: u64) {
        if block.sort_gap_exceeds(&self.table, test_dist) {
            return;
        }
        let counter = Mutex::new(self.counter);
        if block.is_diagonal() {
            let ids = &mut self.ids[block.ii..block.ii_last];
            let set = sweep_diagonal(&self.table, test_dist, block.ii, ids, &counter);
            self.merges.absorb(&set);
        } else {
            let BlockPair { ii, jj, ii_last, jj_last } = block;
            let mid_i = ii + ((ii_last - ii) >> 1);
            let mid_j = jj + ((jj_last - jj) >> 1);
            let (head, tail) = self.ids.split_at_mut(jj);
            let (ki1, ki2) = head[ii..ii_last].split_at_mut(mid_i - ii);
            let (kj1, kj2) = tail[..jj_last - jj].split_at_mut(mid_j - jj);
            let table = &*self.table;

            // Two phases of two disjoint quadrants each: the straight
            // quadrants first, then the cross quadrants. Within a phase
            // the two sides touch disjoint id ranges; only the counter
            // is shared.
            let (a, b) = rayon::join(
                || sweep_block(table, test_dist, ii, &mut *ki1, jj, &mut *kj1, &counter),
                || sweep_block(table, test_dist, mid_i, &mut *ki2, mid_j, &mut *kj2, &counter),
            );
            self.merges.absorb(&a);
            self.merges.absorb(&b);

            let (a, b) = rayon::join(
                || sweep_block(table, test_dist, ii, &mut *ki1, mid_j, &mut *kj2, &counter),
                || sweep_block(table, test_dist, mid_i, &mut *ki2, jj, &mut *kj1, &counter),
            );
            self.merges.absorb(&a);
            self.merges.absorb(&b);
        }
        self.counter = counter.into_inner().unwrap();
    }
}

fn mint(counter: &Mutex<u32>) -> u32 {
    let mut counter = counter.lock().unwrap();
    *counter += 1;
    *counter
}

/// Pairs a block against itself: `b` starts past `a`, so no pair is
/// visited twice and nothing pairs with itself.
fn sweep_diagonal(
    table: &EventTable,
    test_dist: u64,
    start: usize,
    ids: &mut [u32],
    counter: &Mutex<u32>,
) -> MergeSet {
    let mut merges = MergeSet::new();
    for a in 0..ids.len() {
        for b in a + 1..ids.len() {
            let u = ids[a];
            let v = ids[b];
            if v != 0 && v == u {
                continue;
            }
            let d = squared_distance_capped(table.row(start + a), table.row(start + b), test_dist);
            if d > test_dist {
                continue;
            }
            match (u, v) {
                (0, 0) => {
                    let id = mint(counter);
                    ids[a] = id;
                    ids[b] = id;
                }
                (0, _) => ids[a] = v,
                (_, 0) => ids[b] = u,
                _ if u != v => merges.insert(u.min(v), u.max(v)),
                _ => {}
            }
        }
    }
    merges
}

/// Pairs two disjoint row ranges; every `j` row lies past every `i` row.
fn sweep_block(
    table: &EventTable,
    test_dist: u64,
    i_start: usize,
    ki: &mut [u32],
    j_start: usize,
    kj: &mut [u32],
    counter: &Mutex<u32>,
) -> MergeSet {
    let mut merges = MergeSet::new();
    if ki.is_empty() || kj.is_empty() {
        return merges;
    }
    debug_assert!(j_start >= i_start + ki.len());

    let vi = table.sort_value(i_start + ki.len() - 1);
    let vj = table.sort_value(j_start);
    if vj > vi {
        let gap = u64::from(vj - vi);
        if gap * gap > test_dist {
            return merges;
        }
    }

    for a in 0..ki.len() {
        for b in 0..kj.len() {
            let u = ki[a];
            let v = kj[b];
            if v != 0 && v == u {
                continue;
            }
            let d =
                squared_distance_capped(table.row(i_start + a), table.row(j_start + b), test_dist);
            if d > test_dist {
                continue;
            }
            match (u, v) {
                (0, 0) => {
                    let id = mint(counter);
                    ki[a] = id;
                    kj[b] = id;
                }
                (0, _) => ki[a] = v,
                (_, 0) => kj[b] = u,
                _ if u != v => merges.insert(u.min(v), u.max(v)),
                _ => {}
            }
        }
    }
    merges
}
