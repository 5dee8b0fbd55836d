//! Error kinds shared across the crate.

use std::path::PathBuf;

/// Everything that can abort a clustering run.
///
/// Configuration and format errors surface before any worker is spawned;
/// the remaining kinds abort the run in flight. There are no retries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: not a {expected}", .path.display())]
    BadMagic { path: PathBuf, expected: &'static str },

    #[error("{}: wrong endian sentinel (file written on an incompatible platform)", .path.display())]
    BadEndian { path: PathBuf },

    #[error("column count {got} exceeds the supported maximum of {max}")]
    TooManyColumns { got: usize, max: usize },

    #[error("column count {got} does not match the {expected} columns already loaded")]
    ColumnMismatch { got: usize, expected: usize },

    #[error("row count {got} exceeds the supported maximum of {max}")]
    TooManyRows { got: usize, max: usize },

    #[error("worker {worker} minted {count} local ids, above the per-worker span of {span}")]
    LocalIdOverflow { worker: usize, count: u32, span: u32 },

    #[error("cluster id {id} is outside the legal range")]
    IdOutOfRange { id: u32 },

    #[error("genealogy grew past {max} rows")]
    HistoryOverflow { max: usize },

    #[error("worker {worker} disconnected before completing its assignment")]
    WorkerLost { worker: usize },

    #[error("the worker pool disconnected mid-pass")]
    PoolDisconnected,

    #[error("failed to spawn a worker thread")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
