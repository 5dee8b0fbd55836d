//! Command-line entry point for dclust.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn, LevelFilter};

use dclust::{
    dataset, output, reassign, squared_cutoff, sweep, Engine, RunConfig, SweepConfig,
};

/// Unbiased hierarchical density-based parallel clustering of large
/// event sets.
#[derive(Parser, Debug)]
#[command(name = "dclust", version, about, long_about = None)]
struct Args {
    /// Ingested binary input file.
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// First distance cutoff used to place events in the same cluster.
    #[arg(short = 'f', long = "first-cutoff")]
    first_cutoff: f32,

    /// Last distance cutoff to test; defaults to the first. Choose a
    /// value below the first cutoff to scan downward.
    #[arg(short = 'l', long = "last-cutoff")]
    last_cutoff: Option<f32>,

    /// Cutoff increment between passes; always applied as positive.
    #[arg(short = 's', long = "step", default_value_t = 0.5)]
    step: f32,

    /// Rootname for the output files; defaults to the input path.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Keep only clusters holding at least this percentage of events.
    #[arg(short = 'k', long = "keep-pct", default_value_t = 0.5)]
    keep_pct: f32,

    /// Keep only clusters with at least this many events; overrides -k.
    #[arg(short = 'n', long = "keep-count")]
    keep_count: Option<u32>,

    /// Stop scanning once this percentage of events is assigned.
    #[arg(short = 'p', long = "pct-assigned", default_value_t = 95.0)]
    pct_target: f32,

    /// Block size of the pair grid; picked adaptively when omitted.
    #[arg(short = 'b', long = "block-size")]
    block_size: Option<usize>,

    /// Worker count; defaults to the number of cpus.
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Keep scanning even if the number of retained clusters decreases.
    #[arg(short = 'g', long = "go-on")]
    continue_on_decrease: bool,

    /// Re-attach unassigned events to the discovered clusters.
    #[arg(short = 'U', long = "assign-unassigned")]
    assign_unassigned: bool,

    /// Re-attach leftover events (set aside at ingest) to the discovered
    /// clusters.
    #[arg(short = 'L', long = "assign-leftover")]
    assign_leftover: bool,

    /// Report the cluster merging history.
    #[arg(short = 'M', long = "history")]
    report_history: bool,

    /// Verbosity; repeat for more detail.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();
    run(args)
}

fn run(args: Args) -> anyhow::Result<()> {
    let cfg = RunConfig {
        out_root: args.output.unwrap_or_else(|| args.input.clone()),
        last_cutoff: args.last_cutoff.unwrap_or(args.first_cutoff),
        step: args.step.abs(),
        workers: args.workers.unwrap_or_else(num_cpus::get).max(1),
        input: args.input,
        first_cutoff: args.first_cutoff,
        keep_pct: args.keep_pct,
        keep_count: args.keep_count,
        pct_target: args.pct_target,
        block_size: args.block_size,
        continue_on_decrease: args.continue_on_decrease,
        assign_unassigned: args.assign_unassigned,
        assign_leftover: args.assign_leftover,
        report_history: args.report_history,
    };
    cfg.validate()?;
    info!(
        "first_dist {:.3}; last_dist {:.3}; step {:.3}",
        cfg.first_cutoff, cfg.last_cutoff, cfg.step
    );

    let table = Arc::new(dataset::read_selected(&cfg.input)?);
    let min_events = cfg.min_events(table.len(), table.cols());
    info!("keeping clusters of at least {min_events} events");

    let mut engine = Engine::new(Arc::clone(&table), cfg.workers, cfg.block_size)?;
    let sweep_cfg = SweepConfig {
        first_cutoff: cfg.first_cutoff,
        last_cutoff: cfg.last_cutoff,
        step: cfg.step,
        pct_target: cfg.pct_target,
        min_events,
        continue_on_decrease: cfg.continue_on_decrease,
        out_root: cfg.out_root.clone(),
    };
    let mut outcome = sweep::run(&mut engine, &table, &sweep_cfg)?;
    drop(engine);

    if cfg.report_history {
        outcome.genealogy.print_table();
    }

    let parties = cfg.workers + 1;
    let ext_cutoff = outcome.stop_cutoff + outcome.final_step;

    if cfg.assign_unassigned {
        let previous = output::read_sidecar(&cfg.out_root, outcome.last_written, table.len())
            .context("reading the final pass sidecar")?;
        let flagged = reassign::flag_lost_events(&mut outcome.ids, &previous);
        info!("distributing {flagged} events to the {} discovered clusters", outcome.retained);
        reassign::attach_unassigned(&table, &mut outcome.ids, outcome.retained, parties);
    }

    if cfg.assign_leftover {
        let path = output::leftover_path(&cfg.input);
        match dataset::read_leftover(&path, table.cols()) {
            Ok(Some((names, data))) => {
                let test_ext = squared_cutoff(ext_cutoff, table.cols());
                let clusters = reassign::attach_leftover(
                    &table,
                    &outcome.ids,
                    outcome.retained,
                    &data,
                    test_ext,
                    parties,
                );
                let out = output::leftover_clusters_path(&cfg.input);
                output::write_leftover_clusters(&out, &names, &clusters)?;
                info!("wrote leftover cluster assignments to {}", out.display());
            }
            Ok(None) => warn!("no leftover file to treat ({})", path.display()),
            Err(e) => warn!("leftover file unusable: {e}"),
        }
    }

    let assigned = output::write_split(&table, &outcome.ids, outcome.retained, &cfg.out_root)?;
    let rows = table.len();
    info!(
        "{rows} total events; {assigned} assigned ({:.1} %); {} unassigned",
        100.0 * assigned as f64 / rows.max(1) as f64,
        rows - assigned
    );
    Ok(())
}
