//! The coordinator: owns the master id vector during a pass, dispatches
//! block pairs to idle workers under the anti-conflict rule, and drives
//! the merge-set tree reduction.

use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info};

use crate::constants::{
    INITIAL_BLOCK_SIZE, LOCAL_ID_SPAN, MAX_WORKERS, MIN_BLOCK_SIZE, MIN_PAIRS_PER_WORKER,
};
use crate::dataset::EventTable;
use crate::error::{Error, Result};

use super::merge::MergeSet;
use super::message::{channel_mesh, CoordinatorChannels, JoinOrder, Reply, ToWorker};
use super::{worker, BlockPair};

/// The clustering engine: worker threads plus the channel mesh that
/// connects them to this coordinator. Workers outlive individual passes;
/// the engine is built once per run.
pub struct Engine {
    table: Arc<EventTable>,
    channels: CoordinatorChannels,
    handles: Vec<JoinHandle<()>>,
    workers: usize,
    block_size: usize,
}

/// What a pass hands to the canonicalizer.
pub struct PassOutcome {
    /// Ids minted per worker (indexed by `ordinal - 1`). Worker 1's count
    /// includes the seeded ids carried over from the previous pass.
    pub local_counts: Vec<u32>,
    /// The globally reduced merge-request set.
    pub merges: MergeSet,
}

impl PassOutcome {
    /// Clusters alive before canonicalization: every minted id minus one
    /// per merge request.
    pub fn raw_clusters(&self) -> i64 {
        let total: i64 = self.local_counts.iter().map(|&c| i64::from(c)).sum();
        total - self.merges.len() as i64
    }
}

impl Engine {
    /// Spawns `workers` worker threads over a shared event table.
    ///
    /// `block_size` overrides the adaptive choice, which shrinks blocks
    /// until every worker averages at least [`MIN_PAIRS_PER_WORKER`]
    /// assignments, but never below [`MIN_BLOCK_SIZE`] rows.
    pub fn new(table: Arc<EventTable>, workers: usize, block_size: Option<usize>) -> Result<Self> {
        if workers == 0 {
            return Err(Error::Config("at least one worker is required".into()));
        }
        if workers > MAX_WORKERS {
            return Err(Error::Config(format!("at most {MAX_WORKERS} workers are supported")));
        }
        let block_size = resolve_block_size(table.len(), workers, block_size);
        let (channels, worker_ends) = channel_mesh(workers);
        let mut handles = Vec::with_capacity(workers);
        for (idx, end) in worker_ends.into_iter().enumerate() {
            handles.push(worker::spawn(idx + 1, Arc::clone(&table), end)?);
        }
        info!("engine ready: {workers} workers, block size {block_size}");
        Ok(Engine { table, channels, handles, workers, block_size })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Runs one neighbor-joining pass at the given squared cutoff.
    ///
    /// `ids` is the master cluster-id vector; assigned slices are sent
    /// out with each block pair and the updated slices copied back on
    /// completion. `seed` is where worker 1's local counter starts, used
    /// to re-find the clusters carried over from the previous pass.
    pub fn run_pass(&mut self, ids: &mut [u32], test_dist: u64, seed: u32) -> Result<PassOutcome> {
        for w in 1..=self.workers {
            let seed = if w == 1 { seed } else { 0 };
            self.send(w, ToWorker::BeginPass { test_dist, seed })?;
        }

        let pairs = build_pairs(&self.table, self.block_size, test_dist);
        debug!("{} block pairs to compute", pairs.len());

        let mut todo = vec![true; pairs.len()];
        let mut busy: Vec<Option<BlockPair>> = vec![None; self.workers];
        let mut submitted = 0usize;
        let mut all_done = false;
        loop {
            // With any worker idle, submit as many pairs as allowed.
            if submitted < self.workers {
                all_done = true;
                for c in 0..pairs.len() {
                    if !todo[c] {
                        continue;
                    }
                    all_done = false;
                    if self.try_assign(ids, pairs[c], &mut busy)? {
                        todo[c] = false;
                        submitted += 1;
                        if submitted == self.workers {
                            break;
                        }
                    }
                }
            }
            // Wait for whichever worker finishes first.
            if submitted > 0 {
                let w = self.channels.done.recv().map_err(|_| Error::PoolDisconnected)?;
                let block = busy[w - 1].take().ok_or(Error::WorkerLost { worker: w })?;
                self.collect_slices(ids, w, block)?;
                submitted -= 1;
            }
            if submitted == 0 && all_done {
                break;
            }
        }

        let mut local_counts = Vec::with_capacity(self.workers);
        for w in 1..=self.workers {
            self.send(w, ToWorker::Drain)?;
            match self.recv_reply(w)? {
                Reply::FinalCount(count) => {
                    let local = count - (w as u32) * LOCAL_ID_SPAN;
                    if local >= LOCAL_ID_SPAN {
                        return Err(Error::LocalIdOverflow {
                            worker: w,
                            count: local,
                            span: LOCAL_ID_SPAN,
                        });
                    }
                    debug!("final cluster count for worker {w} = {local}");
                    local_counts.push(local);
                }
                _ => return Err(Error::WorkerLost { worker: w }),
            }
        }

        let merges = self.reduce_merge_sets()?;
        debug!(
            "received {} merge requests resulting in {} clusters",
            merges.len(),
            local_counts.iter().map(|&c| i64::from(c)).sum::<i64>() - merges.len() as i64
        );
        Ok(PassOutcome { local_counts, merges })
    }

    /// Binary tree reduction of the per-worker merge sets: at offset `s`,
    /// workers `(w, w + s)` pair up and the higher ordinal's set moves to
    /// the lower, until worker 1 holds the only set left.
    fn reduce_merge_sets(&self) -> Result<MergeSet> {
        let parties = self.workers + 1;
        let mut offset = 1;
        while 1 + offset < parties {
            debug!("aggregating merge requests (workers +{offset})");
            let mut receivers = Vec::new();
            let mut w = 1;
            while w + offset < parties {
                let order = JoinOrder { from: w + offset, to: w };
                self.send(order.to, ToWorker::Join(order))?;
                self.send(order.from, ToWorker::Join(order))?;
                receivers.push(order.to);
                w += 2 * offset;
            }
            for w in receivers {
                match self.recv_reply(w)? {
                    Reply::Joined => {}
                    _ => return Err(Error::WorkerLost { worker: w }),
                }
            }
            offset *= 2;
        }
        for w in 1..=self.workers {
            self.send(w, ToWorker::Join(JoinOrder { from: 0, to: 0 }))?;
        }
        match self.recv_reply(1)? {
            Reply::MergeSet(set) => Ok(set),
            _ => Err(Error::WorkerLost { worker: 1 }),
        }
    }

    /// Assigns a block pair to the lowest-ordinal idle worker, unless a
    /// busy worker already touches either of its row ranges.
    fn try_assign(
        &self,
        ids: &[u32],
        block: BlockPair,
        busy: &mut [Option<BlockPair>],
    ) -> Result<bool> {
        let mut candidate = None;
        for w in (1..=self.workers).rev() {
            match busy[w - 1] {
                Some(active) => {
                    if active.ii == block.ii
                        || active.jj == block.jj
                        || active.ii == block.jj
                        || active.jj == block.ii
                    {
                        return Ok(false);
                    }
                }
                None => candidate = Some(w),
            }
        }
        let Some(w) = candidate else {
            return Ok(false);
        };
        busy[w - 1] = Some(block);
        self.send(w, ToWorker::Assign(block))?;
        self.send(
            w,
            ToWorker::Slice { start: block.ii, ids: ids[block.ii..block.ii_last].to_vec() },
        )?;
        if !block.is_diagonal() {
            self.send(
                w,
                ToWorker::Slice { start: block.jj, ids: ids[block.jj..block.jj_last].to_vec() },
            )?;
        }
        Ok(true)
    }

    fn collect_slices(&self, ids: &mut [u32], w: usize, block: BlockPair) -> Result<()> {
        let expected = if block.is_diagonal() { 1 } else { 2 };
        for _ in 0..expected {
            match self.recv_reply(w)? {
                Reply::Slice { start, ids: slice } => {
                    ids[start..start + slice.len()].copy_from_slice(&slice);
                }
                _ => return Err(Error::WorkerLost { worker: w }),
            }
        }
        Ok(())
    }

    fn send(&self, w: usize, msg: ToWorker) -> Result<()> {
        self.channels.commands[w - 1].send(msg).map_err(|_| Error::WorkerLost { worker: w })
    }

    fn recv_reply(&self, w: usize) -> Result<Reply> {
        self.channels.replies[w - 1].recv().map_err(|_| Error::WorkerLost { worker: w })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for tx in &self.channels.commands {
            let _ = tx.send(ToWorker::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// The upper triangle of the block grid, minus every off-diagonal pair
/// whose sort-key gap already exceeds the cutoff.
pub(crate) fn build_pairs(table: &EventTable, block: usize, test_dist: u64) -> Vec<BlockPair> {
    let rows = table.len();
    let mut pairs = Vec::new();
    let mut ii = 0;
    while ii < rows {
        let ii_last = (ii + block).min(rows);
        let mut jj = ii;
        while jj < rows {
            let jj_last = (jj + block).min(rows);
            let pair = BlockPair { ii, jj, ii_last, jj_last };
            if !pair.sort_gap_exceeds(table, test_dist) {
                pairs.push(pair);
            }
            jj += block;
        }
        ii += block;
    }
    pairs
}

fn resolve_block_size(rows: usize, workers: usize, requested: Option<usize>) -> usize {
    if let Some(size) = requested {
        return size;
    }
    let mut size = INITIAL_BLOCK_SIZE;
    loop {
        let pairs = pair_estimate(rows, size);
        size >>= 1;
        if pairs / workers >= MIN_PAIRS_PER_WORKER || size <= MIN_BLOCK_SIZE / 2 {
            break;
        }
    }
    size << 1
}

fn pair_estimate(rows: usize, block: usize) -> usize {
    let blocks = rows / block + 2;
    blocks * blocks / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_sort_values(values: &[u16]) -> EventTable {
        let rows = values.iter().map(|&v| (0, vec![v, 0, 0, 0])).collect();
        EventTable::from_rows(4, 0, rows).unwrap()
    }

    #[test]
    fn block_size_floors_at_minimum() {
        assert_eq!(resolve_block_size(1_000, 4, None), MIN_BLOCK_SIZE);
        assert_eq!(resolve_block_size(1_000, 4, Some(64)), 64);
    }

    #[test]
    fn block_size_keeps_workers_busy() {
        let size = resolve_block_size(10_000_000, 8, None);
        assert!(size >= MIN_BLOCK_SIZE);
        assert!(pair_estimate(10_000_000, size) / 8 >= MIN_PAIRS_PER_WORKER);
    }

    #[test]
    fn grid_covers_the_upper_triangle() {
        let table = table_with_sort_values(&[0, 1, 2, 3, 4, 5]);
        let pairs = build_pairs(&table, 2, u64::MAX);
        // 3 row blocks: 3 diagonal pairs + 3 off-diagonal pairs.
        assert_eq!(pairs.len(), 6);
        assert!(pairs.iter().all(|p| p.ii <= p.jj));
    }

    #[test]
    fn grid_prunes_far_blocks_by_sort_gap() {
        // Two row blocks 100 apart on the sort key; with the cutoff far
        // below the gap, the off-diagonal pair disappears.
        let table = table_with_sort_values(&[0, 1, 100, 101]);
        let pairs = build_pairs(&table, 2, 16);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.is_diagonal()));

        let pairs = build_pairs(&table, 2, u64::MAX);
        assert_eq!(pairs.len(), 3);
    }
}
