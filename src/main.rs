//! A hello-world benchmark for seglock.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use clap::Parser;
use quanta::Instant;
use rand::Rng;
use seglock::*;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Number of threads.
    #[clap(short, long, default_value_t = NTHREADS)]
    pub nthreads: usize,

    /// Run duration in seconds.
    #[clap(short, long, default_value = "10")]
    pub duration: u64,

    /// Fraction of read transactions.
    #[clap(short, long, default_value = "0.8")]
    pub read_ratio: f64,
}

fn worker(barrier: Arc<Barrier>, db: Arc<Segment>, dur: Duration, read_ratio: f64) -> u64 {
    let mut n = 0;
    barrier.wait();

    const BATCH: u64 = 64;
    let start = Instant::now();
    while start.elapsed() < dur {
        for _ in 0..BATCH {
            if rand::thread_rng().gen_bool(read_ratio) {
                let token = start_read(&db).expect("cannot start read transaction");
                end_read(&db, token).unwrap();
            } else {
                let token = start_write(&db).expect("cannot start write transaction");
                end_write(&db, token).unwrap();
            }
        }
        n += BATCH;
    }
    n
}

fn main() {
    env_logger::init();
    eprintln!("NOTE: this is a hello-world benchmark for seglock.");
    eprintln!("      for algorithm comparisons and latency stats, run `bench`.");

    let args = Args::parse();
    let db = Arc::new(Segment::create(MAX_NODES, DATA_LEN).expect("cannot create segment"));
    init_lock_queue(&db).expect("cannot initialize lock queue");

    let cores = core_affinity::get_core_ids().unwrap_or_default();
    let barrier = Arc::new(Barrier::new(args.nthreads));
    let mut handles = Vec::with_capacity(args.nthreads);
    for i in 0..args.nthreads {
        let barrier = barrier.clone();
        let db = db.clone();
        let core = cores.get(i % cores.len().max(1)).copied();
        let read_ratio = args.read_ratio;
        let dur = Duration::from_secs(args.duration);

        handles.push(thread::spawn(move || {
            if let Some(core) = core {
                core_affinity::set_for_current(core);
            }
            worker(barrier, db, dur, read_ratio)
        }));
    }

    eprintln!("Running for {} seconds...", args.duration);

    let mut total = 0;
    for handle in handles {
        total += handle.join().unwrap();
    }
    println!(
        "OK: {} threads: {} locks/s",
        args.nthreads,
        total as f64 / args.duration as f64
    );
}
