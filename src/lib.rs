mod macros;

pub mod app;
pub mod global;
pub mod lock;
pub mod queued;
pub mod segment;
pub mod utils;

pub use lock::{end_read, end_write, init_lock_queue, start_read, start_write};
pub use lock::{LockError, LockToken};
pub use segment::{Segment, SegmentError, SYN_VAR_PADDING};

/// Default worker count for the bundled benchmarks.
pub const NTHREADS: usize = 8;
/// Default benchmark duration.
pub const DURATION: std::time::Duration = std::time::Duration::from_secs(10);

/// Default queue node pool capacity for benchmark segments.
pub const MAX_NODES: usize = 256;
/// Default data region size for benchmark segments, in bytes.
pub const DATA_LEN: usize = 8 << 10;
