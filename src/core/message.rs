//! Typed messages between the coordinator and its workers.
//!
//! Each worker has a command channel (coordinator to worker, also used
//! for peer merge-set deliveries during the tree reduction) and a
//! dedicated reply channel back to the coordinator; both are ordered and
//! reliable, which is all the protocol asks of a transport. Completion
//! notices travel on one shared channel so the coordinator can wait for
//! whichever worker finishes first.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::merge::MergeSet;
use super::BlockPair;

/// Coordinator-to-worker traffic.
#[derive(Debug)]
pub enum ToWorker {
    /// Start a pass: zero the id vector, seed the local counter.
    /// Only worker 1 ever receives a non-zero seed.
    BeginPass { test_dist: u64, seed: u32 },
    /// Compute one block pair; the id slices for its ranges follow.
    Assign(BlockPair),
    /// A slice of the master id vector, starting at `start`.
    Slice { start: usize, ids: Vec<u32> },
    /// No more blocks this pass; report the final local counter.
    Drain,
    /// One step of the merge-set tree reduction. `from == 0` ends the
    /// reduction.
    Join(JoinOrder),
    /// A peer worker's merge-request set, delivered during reduction.
    MergeSet(MergeSet),
    /// End of the run.
    Shutdown,
}

/// Worker-to-coordinator traffic on the dedicated reply channel.
#[derive(Debug)]
pub enum Reply {
    /// An updated slice of the id vector, starting at `start`.
    Slice { start: usize, ids: Vec<u32> },
    /// The worker's local counter after its last assignment.
    FinalCount(u32),
    /// The worker absorbed its reduction partner's merge set.
    Joined,
    /// The fully reduced merge set (sent by worker 1).
    MergeSet(MergeSet),
}

/// Instructs the pair `(to, from)` to move `from`'s merge set into `to`.
#[derive(Clone, Copy, Debug)]
pub struct JoinOrder {
    pub from: usize,
    pub to: usize,
}

/// The coordinator's end of the mesh, indexed by `ordinal - 1`.
pub struct CoordinatorChannels {
    pub commands: Vec<Sender<ToWorker>>,
    pub replies: Vec<Receiver<Reply>>,
    pub done: Receiver<usize>,
}

/// One worker's end of the mesh.
pub struct WorkerChannels {
    pub commands: Receiver<ToWorker>,
    pub replies: Sender<Reply>,
    pub done: Sender<usize>,
    /// Command senders of every worker, for peer deliveries.
    pub peers: Vec<Sender<ToWorker>>,
}

/// Builds the channel mesh for `workers` workers (ordinals `1..=workers`).
pub fn channel_mesh(workers: usize) -> (CoordinatorChannels, Vec<WorkerChannels>) {
    let (done_tx, done_rx) = unbounded();
    let mut commands = Vec::with_capacity(workers);
    let mut command_rxs = Vec::with_capacity(workers);
    let mut replies = Vec::with_capacity(workers);
    let mut reply_txs = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (cmd_tx, cmd_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        commands.push(cmd_tx);
        command_rxs.push(cmd_rx);
        replies.push(reply_rx);
        reply_txs.push(reply_tx);
    }

    let worker_ends = command_rxs
        .into_iter()
        .zip(reply_txs)
        .map(|(cmd_rx, reply_tx)| WorkerChannels {
            commands: cmd_rx,
            replies: reply_tx,
            done: done_tx.clone(),
            peers: commands.clone(),
        })
        .collect();

    (CoordinatorChannels { commands, replies, done: done_rx }, worker_ends)
}
