//! Global-flag reader/writer lock.
//!
//! A single shared word encodes a writer-active bit and a reader count
//! (Mellor-Crummey & Scott '92, reader preference). A reader makes itself
//! visible with one fetch-and-add and only then tests for an active
//! writer, so readers never wait for each other. A writer enters only
//! when the whole word reads zero, which means a steady stream of readers
//! can hold writers off indefinitely; that trade-off is inherent to the
//! algorithm and kept as-is.

use std::fmt;
use std::hint::spin_loop;
use std::sync::atomic::Ordering::SeqCst;

use bitvec::{field::BitField, prelude as bv};

use crate::lock::LockToken;
use crate::segment::Segment;
use crate::utils::atomics::{atomic_and, compare_and_swap, fetch_and_add};
use crate::utils::timing::{self, TimeItem};
use crate::utils::{SleepBackoff, SLEEP_SHARED_SPIN, SPIN_COUNT};

/// Writer-active flag, bit 0 of the global lock word.
pub const WAFLAG: u64 = GlobalWord::MASK_waflag;
/// Reader count increment; leaves bit 0 to the writer flag.
pub const RC_INCR: u64 = 0x2;

/// Decoded snapshot of the global lock word.
///
/// | Field   | LSB | MSB | Description    |
/// | ------- | --: | --: | -------------- |
/// | waflag  |   0 |   1 | Writer active. |
/// | rdr_cnt |   1 |  64 | Active readers.|
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct GlobalWord(bv::BitArr!(for 64));

impl_word_basic_methods!(GlobalWord);

impl GlobalWord {
    word_field!(waflag, u8, 0..1, WITH_MASK);
    word_field!(rdr_cnt, u64, 1..64);
}

impl fmt::Debug for GlobalWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalWord")
            .field("waflag", &self.waflag())
            .field("rdr_cnt", &self.rdr_cnt())
            .finish()
    }
}

/// Decoded current value of the global lock word.
pub fn snapshot(db: &Segment) -> GlobalWord {
    GlobalWord::from_u64(db.global_lock().load(SeqCst))
}

/// Acquire the exclusive lock. Blocks until no writer and no reader is
/// active. Assumes a validated segment handle.
pub fn start_write(db: &Segment) -> LockToken {
    let gl = db.global_lock();

    // First attempt at getting the lock without spinning.
    timing::begin_time_op(TimeItem::AcqInitialCasOrFaa);
    let acquired = compare_and_swap(gl, 0, WAFLAG);
    timing::end_time_op(TimeItem::AcqInitialCasOrFaa);
    if acquired {
        timing::zero_time_op(TimeItem::AcqWaitTurn);
        return LockToken::global();
    }

    timing::begin_time_op(TimeItem::AcqWaitTurn);
    let mut backoff = SleepBackoff::new(SLEEP_SHARED_SPIN);
    loop {
        for _ in 0..SPIN_COUNT {
            spin_loop();
            if gl.load(SeqCst) == 0 && compare_and_swap(gl, 0, WAFLAG) {
                timing::end_time_op(TimeItem::AcqWaitTurn);
                return LockToken::global();
            }
        }
        backoff.sleep();
    }
}

/// Release the exclusive lock by clearing the writer-active flag.
/// Assumes a validated segment handle.
pub fn end_write(db: &Segment) {
    atomic_and(db.global_lock(), !WAFLAG);
}

/// Acquire a shared hold. Increments the reader count up front, then
/// blocks until no writer is active. Assumes a validated segment handle.
pub fn start_read(db: &Segment) -> LockToken {
    let gl = db.global_lock();

    // Become visible to writers before testing for one.
    timing::begin_time_op(TimeItem::AcqInitialCasOrFaa);
    fetch_and_add(gl, RC_INCR as i64);
    timing::end_time_op(TimeItem::AcqInitialCasOrFaa);

    if gl.load(SeqCst) & WAFLAG == 0 {
        timing::zero_time_op(TimeItem::AcqWaitTurn);
        return LockToken::global();
    }

    timing::begin_time_op(TimeItem::AcqWaitTurn);
    let mut backoff = SleepBackoff::new(SLEEP_SHARED_SPIN);
    loop {
        for _ in 0..SPIN_COUNT {
            spin_loop();
            if gl.load(SeqCst) & WAFLAG == 0 {
                timing::end_time_op(TimeItem::AcqWaitTurn);
                return LockToken::global();
            }
        }
        backoff.sleep();
    }
}

/// Release a shared hold by decrementing the reader count.
/// Assumes a validated segment handle.
pub fn end_read(db: &Segment) {
    fetch_and_add(db.global_lock(), -(RC_INCR as i64));
}
