//! The cutoff sweep controller: drives the engine over a monotonic
//! sequence of cutoffs, maintains the genealogy, and assembles the final
//! clustering from the retained rows.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::constants::LOCAL_ID_SPAN;
use crate::core::{squared_cutoff, Engine, IdForwarder};
use crate::dataset::EventTable;
use crate::error::Result;
use crate::history::Genealogy;
use crate::output;

/// What a sweep needs to know; everything here is resolved before the
/// first pass.
#[derive(Clone, Debug)]
pub struct SweepConfig {
    pub first_cutoff: f32,
    pub last_cutoff: f32,
    /// Cutoff increment, always positive; descending sweeps come from
    /// `first_cutoff > last_cutoff`.
    pub step: f32,
    /// Stop an ascending sweep once this share of events is assigned.
    pub pct_target: f32,
    /// Smallest cluster worth keeping.
    pub min_events: u32,
    /// Keep scanning even when the retained count drops below its
    /// historical maximum.
    pub continue_on_decrease: bool,
    /// Rootname for sidecars and outputs.
    pub out_root: PathBuf,
}

/// Per-pass numbers the stop and step rules look at.
#[derive(Clone, Copy)]
struct PassStats {
    pct_assigned: f32,
    raw: i64,
    trimmed: i64,
}

pub struct SweepOutcome {
    /// The final clustering, dense ids `1..=retained`.
    pub ids: Vec<u32>,
    pub retained: u32,
    pub genealogy: Genealogy,
    /// The cutoff with the most retained clusters.
    pub best_cutoff: f32,
    pub best_retained: i64,
    /// The cutoff whose sidecar holds the last written id vector.
    pub last_written: f32,
    /// Where the cutoff variable stopped; reassignment extends from here.
    pub stop_cutoff: f32,
    /// The step after any doubling.
    pub final_step: f32,
}

/// Sweeps the cutoff range and selects the retained clustering.
pub fn run(engine: &mut Engine, table: &EventTable, cfg: &SweepConfig) -> Result<SweepOutcome> {
    let rows = table.len();
    let mut ids = vec![0u32; rows];
    let mut genealogy = Genealogy::default();
    let mut prev = PassStats { pct_assigned: 0.0, raw: -1, trimmed: -1 };
    let mut pass = 0u32;
    let mut highest: i64 = -1;
    let mut best_cutoff = 0.0f32;
    let mut cutoff = cfg.first_cutoff;
    let mut step = cfg.step;
    let mut last_written = 0.0f32;
    let mut seed = 0u32;

    loop {
        info!("distance cutoff {cutoff:.3}");
        let mut cur = PassStats { pct_assigned: 0.0, raw: -1, trimmed: -1 };
        let test_dist = squared_cutoff(cutoff, table.cols());
        let outcome = engine.run_pass(&mut ids, test_dist, seed)?;
        let raw = outcome.raw_clusters();
        if outcome.merges.dropped() > 0 {
            warn!(
                "{} merge requests were dropped; this pass is over-clustered",
                outcome.merges.dropped()
            );
        }

        let prev_retained = if pass == 0 { None } else { Some(prev.trimmed.max(0) as u32) };
        let merging_preexisting = genealogy.flag_merges(pass, &outcome.merges, prev_retained);

        let mut forwarder = IdForwarder::new(&outcome.local_counts)?;
        forwarder.apply_merges(&outcome.merges, &mut ids)?;
        forwarder.mark_eliminated(&outcome.merges);
        let trimmed = i64::from(forwarder.trim_small(&ids, cfg.min_events));
        cur.trimmed = trimmed;
        info!("{trimmed} clusters retained with at least {} events", cfg.min_events);
        genealogy.record_pass(pass, cutoff, trimmed as u32, prev.trimmed.max(0) as u32)?;
        let first_avail = forwarder.assign_dense(&mut ids, trimmed as u32)?;

        if trimmed == 0 {
            info!("0 of {rows} events assigned");
        } else {
            if trimmed > highest {
                highest = trimmed;
                best_cutoff = cutoff;
            } else if trimmed == highest && cfg.last_cutoff >= cutoff {
                best_cutoff = cutoff;
            }
            // A pass that merged pre-existing clusters pins the previous
            // state under its real cutoff and writes its own sidecar
            // under the real name too; anything else stays in-progress.
            if merging_preexisting {
                output::rename_sidecar(&cfg.out_root, 0.0, last_written);
                output::write_sidecar(&cfg.out_root, cutoff, &ids)?;
            } else {
                output::write_sidecar(&cfg.out_root, 0.0, &ids)?;
            }
            last_written = cutoff;
            let assigned = count_assigned(&ids, trimmed as u32);
            cur.pct_assigned = 100.0 * assigned as f32 / rows as f32;
            info!(
                "{assigned} of {rows} events assigned ({:.1} %), {} unassigned",
                cur.pct_assigned,
                rows - assigned
            );
        }

        let mut done = false;
        if cfg.last_cutoff == cutoff {
            done = true;
        } else if cfg.last_cutoff < cutoff {
            // Descending: stop once nothing survives the size filter.
            if trimmed == 0 {
                done = true;
            } else {
                cutoff -= step;
                if cutoff < cfg.last_cutoff {
                    done = true;
                }
                if !cfg.continue_on_decrease && trimmed < highest {
                    info!("stopping (number of retained clusters decreases)");
                    done = true;
                }
            }
        } else {
            // Ascending: stop once everything merged into a single raw
            // cluster, or enough events are assigned.
            if (raw == 1 && trimmed >= 1 && pass > 0) || cur.pct_assigned >= cfg.pct_target {
                done = true;
            } else {
                let flat = (cur.pct_assigned - prev.pct_assigned) <= 0.1;
                if (trimmed == 1 && cur.pct_assigned > 50.0 && flat)
                    || (cur.pct_assigned >= 99.0 && cur.trimmed == prev.trimmed && flat)
                {
                    step *= 2.0;
                    info!("increasing distance cutoff sampling step to {step:.3}");
                }
                cutoff += step;
                if raw == 0 && prev.raw == 0 {
                    cutoff += step;
                }
                cur.raw = raw;
                if cutoff > cfg.last_cutoff {
                    done = true;
                }
                if !cfg.continue_on_decrease && trimmed < highest {
                    info!("stopping (number of retained clusters decreases)");
                    done = true;
                }
            }
        }

        if done {
            break;
        }

        // Seed the next pass: everything assigned re-enters as worker-1
        // ids, so valid groupings are re-found instead of re-discovered.
        for id in ids.iter_mut() {
            if *id > 0 {
                *id += LOCAL_ID_SPAN;
            }
        }
        seed = first_avail;
        prev = cur;
        pass += 1;
    }

    output::rename_sidecar(&cfg.out_root, 0.0, last_written);

    ids.fill(0);
    genealogy.select();
    let retained = apply_retention(&mut ids, &genealogy, &cfg.out_root, rows);
    info!("sweep done: a maximum of {highest} clusters at distance {best_cutoff:.3}");

    Ok(SweepOutcome {
        ids,
        retained,
        genealogy,
        best_cutoff,
        best_retained: highest,
        last_written,
        stop_cutoff: cutoff,
        final_step: step,
    })
}

/// Copies every retained genealogy row's events out of its pass sidecar,
/// compacting to dense ids in recording order.
fn apply_retention(ids: &mut [u32], genealogy: &Genealogy, root: &Path, rows: usize) -> u32 {
    let mut next = 1u32;
    for row in genealogy.retained() {
        match output::read_sidecar(root, row.cutoff, rows) {
            Ok(pass_ids) => {
                let mut events = 0u64;
                for (id, &was) in ids.iter_mut().zip(&pass_ids) {
                    if was == row.cluster {
                        *id = next;
                        events += 1;
                    }
                }
                info!("cluster {next}: {events} events");
            }
            Err(e) => warn!("skipping a retained cluster: {e}"),
        }
        next += 1;
    }
    next - 1
}

pub(crate) fn count_assigned(ids: &[u32], max_cluster: u32) -> usize {
    ids.iter().filter(|&&id| id > 0 && id <= max_cluster).count()
}
