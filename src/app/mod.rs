//! Application logic (simulated) executed under the database lock.

mod micro_rmw;

pub use micro_rmw::*;

use crate::segment::Segment;

/// Trait for types that can simulate application logic.
pub trait Application {
    /// Run the workload once. The caller holds the appropriate lock.
    fn run(&self, db: &Segment);
}
