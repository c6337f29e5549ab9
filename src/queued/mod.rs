//! Fair queued reader/writer lock.
//!
//! Each request appends a queue node with one atomic swap of the tail and
//! then spins on a private blocked bit (Mellor-Crummey & Scott '92).
//! Release hands the lock to the successor node. Readers coordinate
//! through a shared reader count: a contiguous run of queued readers is
//! unblocked as a chain, each waking the next, so the whole run executes
//! in parallel while writers still observe FIFO order. A writer acquires
//! only as head of the queue with the reader count drained to zero.

mod freelist;

pub(crate) use freelist::init_queue;

use std::fmt;
use std::hint::spin_loop;
use std::sync::atomic::Ordering::SeqCst;

use bitvec::{field::BitField, prelude as bv};

use crate::lock::{LockError, LockToken};
use crate::segment::{QueueNode, Segment};
use crate::utils::atomics::{
    atomic_and, atomic_increment, atomic_or, compare_and_swap, fetch_and_add, fetch_and_store,
};
use crate::utils::timing::{self, TimeItem};
use crate::utils::{spin_until, SleepBackoff, SLEEP_LOCAL_SPIN, SPIN_COUNT};

/// Requester class marker: shared (read) request. Doubles as the
/// successor hint bit a reader sets on its predecessor.
pub const CLASS_READ: u64 = NodeState::MASK_rdr_succ;
/// Requester class marker: exclusive (write) request. Doubles as the
/// successor hint bit a writer sets on its predecessor.
pub const CLASS_WRITE: u64 = NodeState::MASK_wrt_succ;
/// Blocked bit of a node state word.
const BLOCKED: u64 = NodeState::MASK_blocked;

/// Decoded snapshot of a node state word.
///
/// | Field    | LSB | MSB | Description                  |
/// | -------- | --: | --: | ---------------------------- |
/// | blocked  |   0 |   1 | Requester is spinning.       |
/// | rdr_succ |   1 |   2 | A reader enqueued behind us. |
/// | wrt_succ |   2 |   3 | A writer enqueued behind us. |
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct NodeState(bv::BitArr!(for 64));

impl_word_basic_methods!(NodeState);

impl NodeState {
    word_field!(blocked, u8, 0..1, WITH_MASK);
    word_field!(rdr_succ, u8, 1..2, WITH_MASK);
    word_field!(wrt_succ, u8, 2..3, WITH_MASK);
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeState")
            .field("blocked", &self.blocked())
            .field("rdr_succ", &self.rdr_succ())
            .field("wrt_succ", &self.wrt_succ())
            .finish()
    }
}

/// Spin on the node's private blocked bit until a predecessor clears it.
fn wait_unblocked(node: &QueueNode) {
    if node.state.load(SeqCst) & BLOCKED == 0 {
        timing::zero_time_op(TimeItem::AcqWaitTurn);
        return;
    }

    timing::begin_time_op(TimeItem::AcqWaitTurn);
    let mut backoff = SleepBackoff::new(SLEEP_LOCAL_SPIN);
    loop {
        for _ in 0..SPIN_COUNT {
            spin_loop();
            if node.state.load(SeqCst) & BLOCKED == 0 {
                timing::end_time_op(TimeItem::AcqWaitTurn);
                return;
            }
        }
        backoff.sleep();
    }
}

/// Wait for a successor that has already swapped the queue tail to publish
/// its link into our node.
fn wait_successor(node: &QueueNode) -> u64 {
    timing::begin_time_op(TimeItem::RelWaitSucc);
    spin_until(|| node.next.load(SeqCst) != 0);
    timing::end_time_op(TimeItem::RelWaitSucc);
    node.next.load(SeqCst)
}

/// Acquire the exclusive lock. Returns the queue node offset as the lock
/// token. Assumes a validated segment handle.
pub fn start_write(db: &Segment) -> Result<LockToken, LockError> {
    let Some(node_offset) = freelist::alloc_node(db) else {
        log::error!("failed to allocate lock queue node in start_write");
        return Err(LockError::PoolExhausted);
    };

    let locks = db.locks();
    let node = db.node(node_offset);

    node.class.store(CLASS_WRITE, SeqCst);
    node.next.store(0, SeqCst);
    node.state.store(BLOCKED, SeqCst); // blocked, no successor

    // Put ourselves at the end of the queue and check for a predecessor.
    let prev = fetch_and_store(&locks.tail, node_offset);

    if prev == 0 {
        // Empty queue. That does not mean there are no active readers;
        // those are visible only through reader_count. Stand as the next
        // writer and claim the lock if no reader beat us to it; otherwise
        // the reader that drains the count unblocks us.
        locks.next_writer.store(node_offset, SeqCst);
        if locks.reader_count.load(SeqCst) == 0
            && fetch_and_store(&locks.next_writer, 0) == node_offset
        {
            atomic_and(&node.state, !BLOCKED);
        }
    } else {
        // Someone is ahead of us; by definition we wait until all
        // predecessors complete. The unblocking is done either by a lone
        // writer directly before us or by the reader that takes the
        // reader count to zero.
        let prevp = db.node(prev);
        atomic_or(&prevp.state, CLASS_WRITE);
        prevp.next.store(node_offset, SeqCst);
    }

    wait_unblocked(node);
    Ok(LockToken::node(node_offset))
}

/// Release the exclusive lock and hand over to the successor, if any.
/// Assumes a validated segment handle; the token must come from the
/// matching [`start_write`].
pub fn end_write(db: &Segment, token: LockToken) {
    let node_offset = token.offset();
    let locks = db.locks();
    let node = db.node(node_offset);

    // If we are the last node, reset the queue completely (see end_read
    // for why this is safe). A failed swap means a successor appeared
    // between our read of `next` and now; it may still be publishing its
    // link.
    if node.next.load(SeqCst) != 0 || !compare_and_swap(&locks.tail, node_offset, 0) {
        let succ_offset = wait_successor(node);
        let succ = db.node(succ_offset);
        if succ.class.load(SeqCst) & CLASS_READ != 0 {
            atomic_increment(&locks.reader_count, 1);
        }
        atomic_and(&succ.state, !BLOCKED); // unblock successor
    } else {
        timing::zero_time_op(TimeItem::RelWaitSucc);
    }

    freelist::free_node(db, node_offset);
}

/// Acquire a shared hold. Returns the queue node offset as the lock
/// token. Assumes a validated segment handle.
pub fn start_read(db: &Segment) -> Result<LockToken, LockError> {
    let Some(node_offset) = freelist::alloc_node(db) else {
        log::error!("failed to allocate lock queue node in start_read");
        return Err(LockError::PoolExhausted);
    };

    let locks = db.locks();
    let node = db.node(node_offset);

    node.class.store(CLASS_READ, SeqCst);
    node.next.store(0, SeqCst);
    node.state.store(BLOCKED, SeqCst); // blocked, no successor

    let prev = fetch_and_store(&locks.tail, node_offset);

    if prev == 0 {
        // No other requests; count ourselves in and run.
        atomic_increment(&locks.reader_count, 1);
        atomic_and(&node.state, !BLOCKED);
    } else {
        let prevp = db.node(prev);

        if prevp.class.load(SeqCst) & CLASS_WRITE != 0
            || compare_and_swap(&prevp.state, BLOCKED, BLOCKED | CLASS_READ)
        {
            // The predecessor is a writer, or a reader that is itself
            // still blocked and now carries our successor hint. It will
            // increment the reader count on our behalf and unblock us.
            prevp.next.store(node_offset, SeqCst);
            wait_unblocked(node);
        } else {
            // The predecessor is a running reader; we can continue.
            atomic_increment(&locks.reader_count, 1);
            prevp.next.store(node_offset, SeqCst);
            atomic_and(&node.state, !BLOCKED);
        }
    }

    // A reader that enqueued behind us while we were blocked is itself
    // blocked and hinted on our state word. Chain the activation: count
    // it in and wake it, so a whole run of readers enters in parallel.
    if node.state.load(SeqCst) & CLASS_READ != 0 {
        let succ_offset = wait_successor(node);
        atomic_increment(&locks.reader_count, 1);
        let succ = db.node(succ_offset);
        atomic_and(&succ.state, !BLOCKED); // unblock successor
    }

    Ok(LockToken::node(node_offset))
}

/// Release a shared hold. The reader that takes the count to zero wakes
/// the writer waiting for the queue head, if one is lined up. Assumes a
/// validated segment handle; the token must come from the matching
/// [`start_read`].
pub fn end_read(db: &Segment, token: LockToken) {
    let node_offset = token.offset();
    let locks = db.locks();
    let node = db.node(node_offset);

    // With fair queueing a successor can only be a waiting writer or a
    // reader that is already counted; either way the queue contents
    // behind a departing last reader are irrelevant, because live readers
    // are tracked by reader_count. That is why the tail can be cut to
    // none here. The interesting case is the CAS *failing*: a successor
    // has appeared and we must not cut it off.
    if node.next.load(SeqCst) != 0 || !compare_and_swap(&locks.tail, node_offset, 0) {
        let succ_offset = wait_successor(node);
        if node.state.load(SeqCst) & CLASS_WRITE != 0 {
            locks.next_writer.store(succ_offset, SeqCst);
        }
    } else {
        timing::zero_time_op(TimeItem::RelWaitSucc);
    }

    if fetch_and_add(&locks.reader_count, -1) == 1 {
        // We were the last reader. If a writer is in line, unblock it.
        let writer_offset = fetch_and_store(&locks.next_writer, 0);
        if writer_offset != 0 {
            let writer = db.node(writer_offset);
            atomic_and(&writer.state, !BLOCKED);
        }
    }

    freelist::free_node(db, node_offset);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    fn new_db(max_nodes: usize) -> Arc<Segment> {
        let db = Arc::new(Segment::create(max_nodes, 256).unwrap());
        init_queue(&db);
        db
    }

    fn reader_count(db: &Segment) -> u64 {
        db.locks().reader_count.load(SeqCst)
    }

    #[test]
    fn test_state_decoding() {
        assert_eq!(BLOCKED, 0x1);
        assert_eq!(CLASS_READ, 0x2);
        assert_eq!(CLASS_WRITE, 0x4);

        let state = NodeState::from_u64(BLOCKED | CLASS_READ);
        assert_eq!(state.blocked(), 1);
        assert_eq!(state.rdr_succ(), 1);
        assert_eq!(state.wrt_succ(), 0);
        assert_eq!(NodeState::from_u64(CLASS_WRITE).wrt_succ(), 1);
    }

    #[test]
    fn test_single_writer() {
        let db = new_db(8);
        let token = start_write(&db).unwrap();

        // The token is the request's node offset inside the pool.
        let locks = db.locks();
        assert!(token.get() >= locks.storage);
        assert_eq!(reader_count(&db), 0);

        end_write(&db, token);
        assert_eq!(locks.tail.load(SeqCst), 0);
        assert_eq!(reader_count(&db), 0);
    }

    #[test]
    fn test_single_reader() {
        let db = new_db(8);
        let token = start_read(&db).unwrap();
        assert_eq!(reader_count(&db), 1);
        end_read(&db, token);
        assert_eq!(reader_count(&db), 0);
        assert_eq!(db.locks().tail.load(SeqCst), 0);
    }

    #[test]
    fn test_two_readers_in_parallel() {
        let db = new_db(8);
        let inside = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let db = db.clone();
            let inside = inside.clone();
            handles.push(thread::spawn(move || {
                let token = start_read(&db).unwrap();
                inside.wait();
                assert_eq!(reader_count(&db), 2);
                inside.wait();
                end_read(&db, token);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(reader_count(&db), 0);
    }

    #[test]
    fn test_writer_behind_two_readers() {
        let db = new_db(8);
        let r1 = start_read(&db).unwrap();
        let r2 = start_read(&db).unwrap();
        assert_eq!(reader_count(&db), 2);

        let acquired = Arc::new(AtomicBool::new(false));
        let writer = {
            let db = db.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let token = start_write(&db).unwrap();
                acquired.store(true, SeqCst);
                assert_eq!(reader_count(&db), 0);
                end_write(&db, token);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(SeqCst));

        end_read(&db, r1);
        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(SeqCst));

        end_read(&db, r2);
        writer.join().unwrap();
        assert!(acquired.load(SeqCst));
        assert_eq!(reader_count(&db), 0);
    }

    #[test]
    fn test_reader_behind_writer() {
        let db = new_db(8);
        let w = start_write(&db).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let reader = {
            let db = db.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let token = start_read(&db).unwrap();
                acquired.store(true, SeqCst);
                // The releasing writer counted us in on our behalf.
                assert_eq!(reader_count(&db), 1);
                end_read(&db, token);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(SeqCst));

        end_write(&db, w);
        reader.join().unwrap();
        assert!(acquired.load(SeqCst));
        assert_eq!(reader_count(&db), 0);
    }

    #[test]
    fn test_reader_batch_behind_writer() {
        let db = new_db(8);
        let w = start_write(&db).unwrap();

        let inside = Arc::new(Barrier::new(3));
        let checked = Arc::new(Barrier::new(3));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let db = db.clone();
            let inside = inside.clone();
            let checked = checked.clone();
            handles.push(thread::spawn(move || {
                let token = start_read(&db).unwrap();
                // All three readers are active before any releases.
                inside.wait();
                assert_eq!(reader_count(&db), 3);
                checked.wait();
                end_read(&db, token);
            }));
            // Space the enqueues out so they form one contiguous run.
            thread::sleep(Duration::from_millis(20));
        }

        thread::sleep(Duration::from_millis(50));
        end_write(&db, w);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(reader_count(&db), 0);
    }

    #[test]
    fn test_writers_fifo() {
        let db = new_db(8);
        let first = start_write(&db).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..3u32 {
            let db = db.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                let token = start_write(&db).unwrap();
                order.lock().unwrap().push(id);
                end_write(&db, token);
            }));
            // Fix the tail-swap order.
            thread::sleep(Duration::from_millis(20));
        }

        end_write(&db, first);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_pool_exhaustion() {
        let db = new_db(4);
        let holder = start_write(&db).unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let db = db.clone();
            handles.push(thread::spawn(move || {
                let token = start_write(&db).unwrap();
                end_write(&db, token);
            }));
        }
        // Let the three waiters claim the remaining pool cells.
        thread::sleep(Duration::from_millis(100));

        assert_eq!(start_read(&db), Err(LockError::PoolExhausted));
        assert_eq!(start_write(&db), Err(LockError::PoolExhausted));

        end_write(&db, holder);
        for handle in handles {
            handle.join().unwrap();
        }

        // Nodes are recycled once the queue drains.
        let token = start_read(&db).unwrap();
        end_read(&db, token);
        assert_eq!(reader_count(&db), 0);
    }

    #[test]
    fn test_exclusion_under_contention() {
        let db = new_db(16);
        let writers_in = Arc::new(AtomicU64::new(0));
        let readers_in = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let db = db.clone();
            let writers_in = writers_in.clone();
            let readers_in = readers_in.clone();
            handles.push(thread::spawn(move || {
                for round in 0..200 {
                    if (i + round) % 3 == 0 {
                        let token = start_write(&db).unwrap();
                        assert_eq!(writers_in.fetch_add(1, SeqCst), 0);
                        assert_eq!(readers_in.load(SeqCst), 0);
                        assert_eq!(writers_in.fetch_sub(1, SeqCst), 1);
                        end_write(&db, token);
                    } else {
                        let token = start_read(&db).unwrap();
                        readers_in.fetch_add(1, SeqCst);
                        assert_eq!(writers_in.load(SeqCst), 0);
                        readers_in.fetch_sub(1, SeqCst);
                        end_read(&db, token);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(reader_count(&db), 0);
        assert_eq!(db.locks().tail.load(SeqCst), 0);
    }
}
