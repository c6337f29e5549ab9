//! Latency accounting for lock operations.
//!
//! [`LatencyLog`] records individual acquire/release latencies and
//! reduces them to order statistics. On top of it sits a per-phase
//! breakdown of the locking paths, which compiles to no-ops unless the
//! `timed` feature is enabled.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lazy_static::lazy_static;
use strum::EnumCount;

const PHASE_COUNT: usize = TimeItem::COUNT;

/// Running log of operation latencies, kept per thread and folded into a
/// shared log once the thread is done.
pub struct LatencyLog {
    samples: Vec<Duration>,
}

impl LatencyLog {
    /// Create an empty log.
    pub const fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Return true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Record one latency sample.
    pub fn record(&mut self, sample: Duration) {
        self.samples.push(sample);
    }

    /// Fold another log into this one, leaving the other empty.
    pub fn absorb(&mut self, other: &mut LatencyLog) {
        self.samples.append(&mut other.samples);
    }

    /// Reduce the log to order statistics. Quantiles use the ceiling rank
    /// over the sorted samples, so p99 of fewer than 100 samples degrades
    /// to the maximum rather than to a fabricated value.
    pub fn summarize(&mut self) -> LatencySummary {
        self.samples.sort_unstable();
        let count = self.samples.len();
        if count == 0 {
            return LatencySummary::default();
        }

        let quantile = |q: f64| {
            let rank = ((count - 1) as f64 * q).ceil() as usize;
            self.samples[rank]
        };
        let sum: Duration = self.samples.iter().sum();
        LatencySummary {
            count,
            mean: sum / count as u32,
            p50: quantile(0.50),
            p90: quantile(0.90),
            p99: quantile(0.99),
            max: self.samples[count - 1],
        }
    }
}

impl Default for LatencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Order statistics of one latency log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySummary {
    /// Number of samples.
    pub count: usize,
    /// Mean latency.
    pub mean: Duration,
    /// Median latency.
    pub p50: Duration,
    /// 90th percentile latency.
    pub p90: Duration,
    /// 99th percentile latency.
    pub p99: Duration,
    /// Worst observed latency.
    pub max: Duration,
}

impl LatencySummary {
    /// Append the summary to a text file, one `name,nanos` row per
    /// statistic.
    pub fn append_to_file(&self, path: &str, secs: f64) -> io::Result<()> {
        use std::fs::File;
        use std::io::Write;

        let mut file = File::options().append(true).create(true).open(path)?;
        writeln!(file, "count,{}", self.count)?;
        writeln!(file, "throughput,{:.1}", self.count as f64 / secs)?;
        writeln!(file, "mean,{}", self.mean.as_nanos())?;
        writeln!(file, "p50,{}", self.p50.as_nanos())?;
        writeln!(file, "p90,{}", self.p90.as_nanos())?;
        writeln!(file, "p99,{}", self.p99.as_nanos())?;
        writeln!(file, "max,{}", self.max.as_nanos())?;
        writeln!(file)?;
        Ok(())
    }
}

/// Phases of the acquire/release paths.
#[derive(strum::EnumCount, strum::EnumIter, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeItem {
    /// Allocating a queue node from the freelist.
    NodeAlloc = 0,
    /// The uncontended fast path: initial CAS or reader fetch-add.
    AcqInitialCasOrFaa,
    /// Waiting for our turn: the spin-then-sleep loop.
    AcqWaitTurn,
    /// Waiting for a successor to publish its queue link at release.
    RelWaitSucc,
    /// Returning a queue node to the freelist.
    NodeFree,
}

lazy_static! {
    pub static ref RESULTS: [Arc<Mutex<LatencyLog>>; PHASE_COUNT] =
        std::array::from_fn(|_| Arc::new(Mutex::new(LatencyLog::new())));
}

#[cfg(not(feature = "timed"))]
mod timing_impl {
    use super::*;

    pub fn begin_time_op(_: TimeItem) {}
    pub fn end_time_op(_: TimeItem) {}
    pub fn zero_time_op(_: TimeItem) {}
    pub fn commit() {}
    pub fn report(_: &mut dyn io::Write) {}
}

#[cfg(feature = "timed")]
mod timing_impl {
    use super::*;
    use quanta::Instant;
    use std::cell::{Cell, RefCell};
    use strum::IntoEnumIterator;

    thread_local! {
        static LOGS: RefCell<[LatencyLog; PHASE_COUNT]> = RefCell::new([
            LatencyLog::new(),
            LatencyLog::new(),
            LatencyLog::new(),
            LatencyLog::new(),
            LatencyLog::new(),
        ]);
        static STARTS: [Cell<Option<Instant>>; PHASE_COUNT] = [
            Cell::new(None),
            Cell::new(None),
            Cell::new(None),
            Cell::new(None),
            Cell::new(None),
        ];
    }

    pub fn begin_time_op(ty: TimeItem) {
        STARTS.with(|starts| starts[ty as usize].set(Some(Instant::now())));
    }

    pub fn end_time_op(ty: TimeItem) {
        let start = STARTS.with(|starts| starts[ty as usize].take());
        if let Some(start) = start {
            LOGS.with(|logs| logs.borrow_mut()[ty as usize].record(start.elapsed()));
        }
    }

    pub fn zero_time_op(ty: TimeItem) {
        LOGS.with(|logs| logs.borrow_mut()[ty as usize].record(Duration::ZERO));
    }

    /// Fold this thread's samples into the global results.
    pub fn commit() {
        LOGS.with(|logs| {
            let mut logs = logs.borrow_mut();
            for (i, result) in RESULTS.iter().enumerate() {
                result.lock().unwrap().absorb(&mut logs[i]);
            }
        });
    }

    pub fn report(w: &mut dyn io::Write) {
        for ty in TimeItem::iter() {
            let summary = RESULTS[ty as u8 as usize].lock().unwrap().summarize();
            writeln!(
                w,
                "{:?}: {} samples, mean {:?}, p50 {:?}, p99 {:?}, max {:?}",
                ty, summary.count, summary.mean, summary.p50, summary.p99, summary.max
            )
            .unwrap();
        }
    }
}

pub use timing_impl::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_order_statistics() {
        let mut log = LatencyLog::new();
        for i in (1..=100u64).rev() {
            log.record(Duration::from_nanos(i));
        }
        let summary = log.summarize();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.p50, Duration::from_nanos(51));
        assert_eq!(summary.p90, Duration::from_nanos(91));
        assert_eq!(summary.p99, Duration::from_nanos(100));
        assert_eq!(summary.max, Duration::from_nanos(100));
    }

    #[test]
    fn test_summary_small_log_degrades_to_max() {
        let mut log = LatencyLog::new();
        log.record(Duration::from_nanos(3));
        log.record(Duration::from_nanos(7));
        let summary = log.summarize();
        assert_eq!(summary.p99, Duration::from_nanos(7));
        assert_eq!(summary.mean, Duration::from_nanos(5));
    }

    #[test]
    fn test_empty_log() {
        let mut log = LatencyLog::new();
        assert!(log.is_empty());
        let summary = log.summarize();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.max, Duration::ZERO);
    }

    #[test]
    fn test_absorb_drains() {
        let mut a = LatencyLog::new();
        let mut b = LatencyLog::new();
        b.record(Duration::from_nanos(5));
        a.absorb(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.summarize().count, 1);
    }

    #[cfg(feature = "timed")]
    #[test]
    fn test_phase_begin_end_records() {
        begin_time_op(TimeItem::AcqWaitTurn);
        end_time_op(TimeItem::AcqWaitTurn);
        zero_time_op(TimeItem::NodeAlloc);
        commit();

        let count = RESULTS[TimeItem::AcqWaitTurn as usize]
            .lock()
            .unwrap()
            .summarize()
            .count;
        assert!(count >= 1);
    }
}
