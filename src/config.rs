//! Run configuration, resolved once before anything is spawned.

use std::path::PathBuf;

use log::warn;

use crate::error::{Error, Result};

/// Everything a clustering run needs to know.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// The ingested binary input file.
    pub input: PathBuf,
    /// Rootname for sidecars and outputs; defaults to the input path.
    pub out_root: PathBuf,
    pub first_cutoff: f32,
    /// Defaults to `first_cutoff` (a single-pass run).
    pub last_cutoff: f32,
    pub step: f32,
    /// Keep clusters holding at least this share of events, unless an
    /// explicit count overrides it.
    pub keep_pct: f32,
    pub keep_count: Option<u32>,
    /// Stop an ascending sweep once this share of events is assigned.
    pub pct_target: f32,
    /// Overrides the adaptive block size.
    pub block_size: Option<usize>,
    pub workers: usize,
    pub continue_on_decrease: bool,
    pub assign_unassigned: bool,
    pub assign_leftover: bool,
    pub report_history: bool,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(Error::Config("an input file is required".into()));
        }
        if self.first_cutoff < 1e-5 {
            return Err(Error::Config("the first distance cutoff must be positive".into()));
        }
        if self.step <= 0.0 {
            return Err(Error::Config(
                "the step must be positive; scan downward by choosing a first \
                 cutoff above the last"
                    .into(),
            ));
        }
        Ok(())
    }

    /// The minimum cluster size: the explicit count when given, else the
    /// percentage of loaded events.
    pub fn min_events(&self, rows: usize, cols: usize) -> u32 {
        let count = match self.keep_count {
            Some(count) => count,
            None => (rows as f32 / 100.0 * self.keep_pct) as u32,
        };
        if count < cols as u32 {
            warn!("minimum cluster size is below the column count ({count} < {cols})");
        }
        count
    }
}
