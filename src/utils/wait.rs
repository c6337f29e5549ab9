//! Spin-wait machinery.

use std::hint::spin_loop;
use std::thread;
use std::time::Duration;

use quanta::Instant;

/// Iterations of one tight spin burst before giving up the CPU.
#[cfg(windows)]
pub const SPIN_COUNT: usize = 100_000;
/// Iterations of one tight spin burst before giving up the CPU.
/// Shorter spins perform better with Linux.
#[cfg(not(windows))]
pub const SPIN_COUNT: usize = 500;

/// Initial backoff increment for spins on a shared word that other
/// requesters keep mutating.
#[cfg(windows)]
pub const SLEEP_SHARED_SPIN: Duration = Duration::from_millis(1);
/// Initial backoff increment for spins on a shared word that other
/// requesters keep mutating.
#[cfg(not(windows))]
pub const SLEEP_SHARED_SPIN: Duration = Duration::from_micros(500);

/// Initial backoff increment for spins on a requester-private word;
/// just deschedules the thread.
#[cfg(windows)]
pub const SLEEP_LOCAL_SPIN: Duration = Duration::from_millis(1);
/// Initial backoff increment for spins on a requester-private word;
/// just deschedules the thread.
#[cfg(not(windows))]
pub const SLEEP_LOCAL_SPIN: Duration = Duration::from_nanos(1);

/// Escalating sleep between spin bursts. Each call sleeps for the current
/// interval and lengthens the next one by the initial step.
pub struct SleepBackoff {
    step: Duration,
    current: Duration,
}

impl SleepBackoff {
    pub fn new(step: Duration) -> Self {
        Self {
            step,
            current: step,
        }
    }

    /// Give up the CPU so the lock holder(s) can continue.
    pub fn sleep(&mut self) {
        thread::sleep(self.current);
        self.current += self.step;
    }
}

/// Spin until `cond` holds, with the CPU relaxation hint and a yield every
/// [`SPIN_COUNT`] iterations. Only for conditions that become true
/// imminently, such as a successor that already swapped the queue tail
/// publishing its link; never sleeps.
pub fn spin_until(cond: impl Fn() -> bool) {
    let mut i = 0usize;
    while !cond() {
        spin_loop();
        i += 1;
        if i % SPIN_COUNT == 0 {
            thread::yield_now();
        }
    }
}

/// Pin the CPU for `nanos` nanoseconds of think time.
pub fn busy_wait(nanos: u64) {
    let think = Duration::from_nanos(nanos);
    let start = Instant::now();
    while start.elapsed() < think {
        spin_loop();
    }
}
