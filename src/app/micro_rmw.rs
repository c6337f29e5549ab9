//! Microbenchmark workloads over the segment data region.

use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

use crate::segment::Segment;
use crate::utils;

/// Microbenchmark: read-modify-write one word of the data region.
///
/// The load and the store straddle a think time, so two instances running
/// without an exclusive lock lose updates; the final counter value tells
/// whether mutual exclusion held.
pub struct MicroRmw {
    slot: usize,
    think: Duration,
}

impl MicroRmw {
    /// Create a new RMW execution instance.
    pub fn new(slot: usize, think: Duration) -> Self {
        Self { slot, think }
    }
}

impl super::Application for MicroRmw {
    fn run(&self, db: &Segment) {
        let words = db.data_words();
        let value = words[self.slot].load(SeqCst);
        utils::busy_wait(self.think.as_nanos() as u64);
        words[self.slot].store(value + 1, SeqCst);
    }
}

/// Microbenchmark: read one word of the data region.
pub struct MicroRo {
    slot: usize,
}

impl MicroRo {
    /// Create a new read-only execution instance.
    pub fn new(slot: usize) -> Self {
        Self { slot }
    }
}

impl super::Application for MicroRo {
    fn run(&self, db: &Segment) {
        let words = db.data_words();
        let _ = words[self.slot].load(SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Application;

    #[test]
    fn test_rmw_increments_slot() {
        let db = Segment::create(0, 64).unwrap();
        let rmw = MicroRmw::new(0, Duration::ZERO);
        rmw.run(&db);
        rmw.run(&db);
        assert_eq!(db.data_words()[0].load(SeqCst), 2);
    }
}
