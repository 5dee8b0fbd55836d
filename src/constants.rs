//! Hard-coded limits for dclust and its dependents.

/// Maximum number of events a run will load.
pub const MAX_EVENTS: usize = 15_000_000;

/// Maximum number of data columns per event. The binary formats reserve
/// two bytes per column; readers reject anything wider.
pub const MAX_COLUMNS: usize = 64;

/// Exclusive upper bound on quantized input values.
pub const MAX_INPUT_VALUE: u16 = 16_384;

/// Stride between the local-id ranges of consecutive workers. A worker
/// `w` mints cluster ids in `w * LOCAL_ID_SPAN + 1 ..`, so no worker may
/// invent more than this many clusters in a single pass.
pub const LOCAL_ID_SPAN: u32 = 4_000_000;

/// Maximum number of genealogy rows recorded over a whole sweep.
pub const MAX_CLUSTERS: usize = 1_000_000;

/// Capacity of a merge-request set. Inserts beyond this are dropped
/// (logged once), which can only over-cluster the pass.
pub const MAX_MERGE_REQUESTS: usize = 786_432;

/// Maximum number of workers (the coordinator is not counted).
pub const MAX_WORKERS: usize = 128;

/// Smallest block size the adaptive grid will pick on its own.
pub const MIN_BLOCK_SIZE: usize = 256;

/// Starting point for the adaptive block-size search.
pub const INITIAL_BLOCK_SIZE: usize = 131_072;

/// Every block pair should keep a worker busy for at least this many
/// assignments on average before the grid stops shrinking blocks.
pub const MIN_PAIRS_PER_WORKER: usize = 100;

/// Length of the ASCII magic at the start of every binary file.
pub const MAGIC_SIZE: usize = 32;

/// Length of the column-header text stored in binary files.
pub const TEXT_HEADER_SIZE: usize = 2048;

/// Length of one stored event-name string.
pub const NAME_SIZE: usize = 32;

/// Magic of ingested input files.
pub const INPUT_MAGIC: &[u8; MAGIC_SIZE] = b"dclust input file v1.0        \n\0";

/// Magic of the assigned-events output file.
pub const ASSIGNED_MAGIC: &[u8; MAGIC_SIZE] = b"dclust assigned file v1.0     \n\0";

/// Magic of the unassigned-events output file (also the leftover format).
pub const UNASSIGNED_MAGIC: &[u8; MAGIC_SIZE] = b"dclust unassigned file v1.0   \n\0";

/// Every binary file stores this sentinel right after the magic; a reader
/// seeing anything else is looking at a byte-swapped file.
pub const ENDIAN_SENTINEL: u32 = 1;
