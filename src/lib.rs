//! dclust: unbiased hierarchical density-based parallel clustering of
//! large quantized event sets.
//!
//! A run sweeps a Euclidean distance cutoff over the event table. Each
//! pass groups events that are transitively within the cutoff, using a
//! coordinator and a set of workers over disjoint block pairs; the
//! genealogy of clusters across passes then decides which clustering
//! each sub-tree keeps.

pub mod config;
pub mod constants;
pub mod core;
pub mod dataset;
mod error;
pub mod history;
pub mod output;
pub mod reassign;
pub mod sweep;

pub use crate::config::RunConfig;
pub use crate::core::{squared_cutoff, Engine, PassOutcome};
pub use crate::dataset::EventTable;
pub use crate::error::{Error, Result};
pub use crate::history::Genealogy;
pub use crate::sweep::{SweepConfig, SweepOutcome};
