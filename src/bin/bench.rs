//! Lock benchmark: drives either locking algorithm over one shared
//! segment and reports acquire latency and throughput.
//!
//! Writers run a read-modify-write workload on the segment data region,
//! so the final counter value doubles as a mutual exclusion check.

use std::io;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use clap::Parser;
use quanta::Instant;
use rand::prelude::*;

use seglock::app::{Application, MicroRmw, MicroRo};
use seglock::utils::timing::{self, LatencyLog};
use seglock::{global, queued, Segment, DATA_LEN, MAX_NODES, NTHREADS};

/// Locking algorithm under test.
#[derive(strum::EnumString, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAlgo {
    Global,
    Queued,
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Locking algorithm.
    #[clap(short, long, default_value = "Queued")]
    algo: LockAlgo,

    /// Number of threads.
    #[clap(short, long, default_value_t = NTHREADS)]
    nthreads: usize,

    /// Run duration in seconds.
    #[clap(short, long, default_value = "10")]
    duration: u64,

    /// Fraction of read transactions.
    #[clap(short, long, default_value = "0.8")]
    read_ratio: f64,

    /// Think time inside the critical section, in nanoseconds.
    #[clap(short, long, default_value = "0")]
    think: u64,

    /// Result output file for the latency CDF.
    #[clap(short, long, default_value = None)]
    output: Option<String>,
}

#[allow(clippy::too_many_arguments)]
fn worker(
    id: usize,
    algo: LockAlgo,
    db: Arc<Segment>,
    barrier: Arc<Barrier>,
    dur: Duration,
    read_ratio: f64,
    think: Duration,
    stats: Arc<Vec<Mutex<LatencyLog>>>,
) -> (u64, u64) {
    let writer_app = MicroRmw::new(0, think);
    let reader_app = MicroRo::new(0);
    let mut log = LatencyLog::new();
    let mut rng = rand::thread_rng();
    let (mut ops, mut writes) = (0u64, 0u64);

    barrier.wait();
    let start = Instant::now();
    while start.elapsed() < dur {
        let is_read = rng.gen_bool(read_ratio);
        let begin = Instant::now();
        match algo {
            LockAlgo::Global => {
                if is_read {
                    global::start_read(&db);
                    log.record(begin.elapsed());
                    reader_app.run(&db);
                    global::end_read(&db);
                } else {
                    global::start_write(&db);
                    log.record(begin.elapsed());
                    writer_app.run(&db);
                    global::end_write(&db);
                    writes += 1;
                }
            }
            LockAlgo::Queued => {
                if is_read {
                    let token = queued::start_read(&db).expect("cannot start read transaction");
                    log.record(begin.elapsed());
                    reader_app.run(&db);
                    queued::end_read(&db, token);
                } else {
                    let token = queued::start_write(&db).expect("cannot start write transaction");
                    log.record(begin.elapsed());
                    writer_app.run(&db);
                    queued::end_write(&db, token);
                    writes += 1;
                }
            }
        }
        ops += 1;
    }

    stats[id].lock().unwrap().absorb(&mut log);
    timing::commit();
    (ops, writes)
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let db = Arc::new(Segment::create(MAX_NODES, DATA_LEN).expect("cannot create segment"));
    seglock::init_lock_queue(&db).expect("cannot initialize lock queue");

    let cores = core_affinity::get_core_ids().unwrap_or_default();
    let barrier = Arc::new(Barrier::new(args.nthreads));
    let stats: Arc<Vec<Mutex<LatencyLog>>> = Arc::new(
        (0..args.nthreads)
            .map(|_| Mutex::new(LatencyLog::new()))
            .collect(),
    );

    let dur = Duration::from_secs(args.duration);
    let think = Duration::from_nanos(args.think);

    let mut handles = Vec::with_capacity(args.nthreads);
    for i in 0..args.nthreads {
        let db = db.clone();
        let barrier = barrier.clone();
        let stats = stats.clone();
        let core = cores.get(i % cores.len().max(1)).copied();
        let (algo, read_ratio) = (args.algo, args.read_ratio);

        handles.push(thread::spawn(move || {
            if let Some(core) = core {
                core_affinity::set_for_current(core);
            }
            worker(i, algo, db, barrier, dur, read_ratio, think, stats)
        }));
    }

    eprintln!("Running {:?} for {} seconds...", args.algo, args.duration);

    let (mut total_ops, mut total_writes) = (0u64, 0u64);
    for handle in handles {
        let (ops, writes) = handle.join().unwrap();
        total_ops += ops;
        total_writes += writes;
    }

    let mut merged = LatencyLog::new();
    for log in stats.iter() {
        merged.absorb(&mut log.lock().unwrap());
    }
    let summary = merged.summarize();

    // Each write transaction performed one RMW on slot 0; a lost update
    // here would mean the lock failed to exclude writers.
    let counter = db.data_words()[0].load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(counter, total_writes, "write counter mismatch");

    println!(
        "OK: {:?}: {} threads: {:.0} locks/s, acquire p50 {:?}, p99 {:?}",
        args.algo,
        args.nthreads,
        total_ops as f64 / args.duration as f64,
        summary.p50,
        summary.p99,
    );

    if let Some(path) = &args.output {
        let secs = args.duration as f64;
        summary
            .append_to_file(path, secs)
            .expect("cannot write output file");
    }

    timing::report(&mut io::stderr());
}
