//! Database-level transaction locking.
//!
//! These entry points implement the giant shared/exclusive lock over a
//! database segment. The rest of a database API is implemented
//! independently, so use of the locking routines does not by itself
//! guarantee isolation of record-level operations.
//!
//! The backing algorithm is chosen at build time: by default the
//! reader-preference global-flag lock; with the `queued-locks` feature
//! the fair queued lock. Both algorithm modules are always compiled and
//! can be driven directly, e.g. for benchmarking one against the other.
//!
//! The API is not reentrant: a thread must not request the lock again
//! while holding it, and there is no lock composition.

use thiserror::Error;

use crate::segment::Segment;
use crate::{global, queued};

/// Errors surfaced by the locking API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// The handle does not point at an initialized database segment.
    #[error("invalid database segment handle")]
    InvalidSegment,

    /// The lock queue node pool has no free cells. The matching `end_*`
    /// must not be called.
    #[error("lock queue node pool exhausted")]
    PoolExhausted,
}

/// Proof of a held lock, passed back on release.
///
/// Under the queued algorithm this is the offset of the request's queue
/// node; under the global-flag algorithm it is a fixed marker. Always
/// non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken(u64);

impl LockToken {
    pub(crate) fn node(offset: u64) -> Self {
        LockToken(offset)
    }

    pub(crate) fn global() -> Self {
        LockToken(1)
    }

    /// The raw token word.
    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn offset(self) -> u64 {
        self.0
    }
}

/// Start a write transaction: acquire the database-level exclusive lock.
/// Blocks until the lock is acquired.
pub fn start_write(db: &Segment) -> Result<LockToken, LockError> {
    if !db.check() {
        log::error!("invalid database segment in start_write");
        return Err(LockError::InvalidSegment);
    }
    if cfg!(feature = "queued-locks") {
        queued::start_write(db)
    } else {
        Ok(global::start_write(db))
    }
}

/// End a write transaction: release the database-level exclusive lock.
/// `token` must be the value returned by the matching [`start_write`].
pub fn end_write(db: &Segment, token: LockToken) -> Result<(), LockError> {
    if !db.check() {
        log::error!("invalid database segment in end_write");
        return Err(LockError::InvalidSegment);
    }
    if cfg!(feature = "queued-locks") {
        queued::end_write(db, token);
    } else {
        global::end_write(db);
    }
    Ok(())
}

/// Start a read transaction: acquire a database-level shared hold.
/// Blocks until there is no active writer.
pub fn start_read(db: &Segment) -> Result<LockToken, LockError> {
    if !db.check() {
        log::error!("invalid database segment in start_read");
        return Err(LockError::InvalidSegment);
    }
    if cfg!(feature = "queued-locks") {
        queued::start_read(db)
    } else {
        Ok(global::start_read(db))
    }
}

/// End a read transaction: release the shared hold.
/// `token` must be the value returned by the matching [`start_read`].
pub fn end_read(db: &Segment, token: LockToken) -> Result<(), LockError> {
    if !db.check() {
        log::error!("invalid database segment in end_read");
        return Err(LockError::InvalidSegment);
    }
    if cfg!(feature = "queued-locks") {
        queued::end_read(db, token);
    } else {
        global::end_read(db);
    }
    Ok(())
}

/// Initialize the lock state of a freshly created (or re-initialized)
/// segment: reset the control words and thread the node pool onto the
/// freelist. Not thread-safe; call once during database creation.
pub fn init_lock_queue(db: &Segment) -> Result<(), LockError> {
    use std::sync::atomic::Ordering::SeqCst;

    if !db.check() {
        log::error!("invalid database segment in init_lock_queue");
        return Err(LockError::InvalidSegment);
    }

    db.global_lock().store(0, SeqCst);
    let locks = db.locks();
    locks.tail.store(0, SeqCst);
    locks.next_writer.store(0, SeqCst);
    locks.reader_count.store(0, SeqCst);
    queued::init_queue(db);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::SeqCst;

    fn new_db() -> Segment {
        let db = Segment::create(8, 256).unwrap();
        init_lock_queue(&db).unwrap();
        db
    }

    #[test]
    fn test_invalid_segment_rejected() {
        #[repr(align(128))]
        struct Buf([u8; 4096]);
        let mut buf = Buf([0; 4096]);
        let bogus = unsafe { Segment::attach(buf.0.as_mut_ptr(), 4096) }.unwrap();

        assert_eq!(start_write(&bogus), Err(LockError::InvalidSegment));
        assert_eq!(start_read(&bogus), Err(LockError::InvalidSegment));
        assert_eq!(init_lock_queue(&bogus), Err(LockError::InvalidSegment));
        assert_eq!(
            end_write(&bogus, LockToken::global()),
            Err(LockError::InvalidSegment)
        );
        assert_eq!(
            end_read(&bogus, LockToken::global()),
            Err(LockError::InvalidSegment)
        );
    }

    #[test]
    fn test_write_transaction_roundtrip() {
        let db = new_db();
        let token = start_write(&db).unwrap();
        assert!(token.get() > 0);
        end_write(&db, token).unwrap();

        // The reader count is untouched by a write transaction.
        assert_eq!(db.locks().reader_count.load(SeqCst), 0);
        assert_eq!(db.global_lock().load(SeqCst), 0);
    }

    #[test]
    fn test_read_transaction_roundtrip() {
        let db = new_db();
        let token = start_read(&db).unwrap();
        assert!(token.get() > 0);
        end_read(&db, token).unwrap();

        assert_eq!(db.locks().reader_count.load(SeqCst), 0);
        assert_eq!(db.global_lock().load(SeqCst), 0);
    }

    #[test]
    fn test_reinit_resets_lock_state() {
        let db = new_db();
        let token = start_read(&db).unwrap();
        end_read(&db, token).unwrap();

        init_lock_queue(&db).unwrap();
        assert_eq!(db.locks().tail.load(SeqCst), 0);
        assert_eq!(db.locks().reader_count.load(SeqCst), 0);
        assert_eq!(db.locks().freelist.load(SeqCst), db.locks().storage);
    }
}
