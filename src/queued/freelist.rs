//! Lock-free recycling of queue nodes.
//!
//! Nodes live in a fixed pool inside the segment and circulate through a
//! Treiber stack with per-node reference counts (Valois '95). A cell is
//! pushed back only once its count reaches zero, and bit 0 of the count
//! marks a cell claimed for the push, so an offset pinned by a concurrent
//! allocation attempt is never recycled under it.

use std::sync::atomic::Ordering::SeqCst;

use crate::segment::{Segment, SYN_VAR_PADDING};
use crate::utils::atomics::{atomic_increment, compare_and_swap};
use crate::utils::timing::{self, TimeItem};

/// Thread every pool cell onto the freelist.
/// Not parallel-safe; run while the segment is being (re)initialized.
pub(crate) fn init_queue(db: &Segment) {
    let locks = db.locks();
    let storage = locks.storage;
    let max_nodes = locks.max_nodes;

    for i in 0..max_nodes {
        let offset = storage + i * SYN_VAR_PADDING as u64;
        let cell = db.node(offset);
        cell.refcount.store(1, SeqCst);
        let next = if i + 1 < max_nodes {
            offset + SYN_VAR_PADDING as u64
        } else {
            0
        };
        cell.next_cell.store(next, SeqCst);
    }

    // Top of the stack points to the first cell in the chunk.
    let top = if max_nodes > 0 { storage } else { 0 };
    locks.freelist.store(top, SeqCst);
}

/// Allocate a cell for a lock request. Returns its offset, or `None` when
/// the pool is exhausted.
pub(crate) fn alloc_node(db: &Segment) -> Option<u64> {
    let locks = db.locks();

    timing::begin_time_op(TimeItem::NodeAlloc);
    loop {
        let top = locks.freelist.load(SeqCst);
        if top == 0 {
            // End of chain.
            timing::end_time_op(TimeItem::NodeAlloc);
            return None;
        }
        let cell = db.node(top);

        // Pin the cell before racing for the pop, so a concurrent free
        // cannot recycle it while we read its freelist link.
        atomic_increment(&cell.refcount, 2);
        let next = cell.next_cell.load(SeqCst);
        if compare_and_swap(&locks.freelist, top, next) {
            atomic_increment(&cell.refcount, -1); // clear the claimed bit
            timing::end_time_op(TimeItem::NodeAlloc);
            return Some(top);
        }

        // Lost the race; drop our pin and retry.
        free_node(db, top);
    }
}

/// Release one reference to a cell. The reference that brings the count
/// to zero pushes the cell back onto the freelist.
pub(crate) fn free_node(db: &Segment, node: u64) {
    let locks = db.locks();
    let cell = db.node(node);

    timing::begin_time_op(TimeItem::NodeFree);
    atomic_increment(&cell.refcount, -2);

    // Succeeds iff no references remain; the 1 claims the push.
    if compare_and_swap(&cell.refcount, 0, 1) {
        loop {
            let top = locks.freelist.load(SeqCst);
            cell.next_cell.store(top, SeqCst);
            if compare_and_swap(&locks.freelist, top, node) {
                break;
            }
        }
    }
    timing::end_time_op(TimeItem::NodeFree);
}
