//! # Lock-Free Reader/Writer Coordination
//!
//! Readers never block. Instead, the writer publishes what it is doing
//! through a shared triple `{modify_flag, counter, offset}` plus a short
//! window of recently modified offsets, and every reader validates each edge
//! it consumed against that publication:
//!
//! ```text
//! writer, per structural store          reader, per edge read
//! -----------------------------         ---------------------------------
//! offset   <- edge being stored         snapshot <- {flag, counter, offset}
//! flag     <- 1        (release)        ... read the edge bytes ...
//! ... store the edge bytes ...          verify(edge_offset):
//! cache[counter % N] <- offset            snapshot said flag=1 on my edge?
//! counter  <- counter + 1                 counter moved past the window?
//! flag     <- 0        (release)          my edge in the modified window?
//!                                         any hit -> TryAgain (re-walk)
//! ```
//!
//! The counter is the ABA guard: an edge freed and reused at the same offset
//! between snapshot and verify advances the counter, and a reader whose
//! snapshot fell behind by more than the window depth gives up
//! conservatively. Verification failure only ever causes a re-walk, so a
//! reader observes either a fully committed edge or retries.
//!
//! Orderings: the writer's flag stores are `Release` so the edge bytes it
//! wrote are visible before the flag clears; reader loads are `Acquire` to
//! pair with them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::MAX_OFFSET_CACHE;

/// Shared lock-free coordination block, embedded in the store header.
/// Field order is part of the on-disk format.
#[repr(C)]
pub struct LockFreeShm {
    modify_flag: AtomicU32,
    counter: AtomicU32,
    offset: AtomicU64,
    offset_cache: [AtomicU64; MAX_OFFSET_CACHE],
}

/// A reader's captured view of the writer publication state.
#[derive(Debug, Clone, Copy)]
pub struct LockFreeSnapshot {
    modify_flag: u32,
    counter: u32,
    offset: u64,
}

impl LockFreeShm {
    /// Writer-side: announce the edge offset about to be stored.
    pub fn writer_start(&self, offset: u64) {
        self.offset.store(offset, Ordering::Relaxed);
        self.modify_flag.store(1, Ordering::Release);
    }

    /// Writer-side: record the store in the modified window and clear the
    /// in-progress flag.
    pub fn writer_stop(&self) {
        let counter = self.counter.load(Ordering::Relaxed);
        let offset = self.offset.load(Ordering::Relaxed);
        self.offset_cache[counter as usize % MAX_OFFSET_CACHE].store(offset, Ordering::Relaxed);
        self.counter.store(counter.wrapping_add(1), Ordering::Relaxed);
        self.modify_flag.store(0, Ordering::Release);
    }

    /// Writer-side: reset the flag on clean shutdown.
    pub fn writer_reset(&self) {
        self.modify_flag.store(0, Ordering::Release);
    }

    /// Reader-side: capture the publication state before a walk.
    pub fn reader_start(&self) -> LockFreeSnapshot {
        LockFreeSnapshot {
            modify_flag: self.modify_flag.load(Ordering::Acquire),
            counter: self.counter.load(Ordering::Acquire),
            offset: self.offset.load(Ordering::Acquire),
        }
    }

    /// Reader-side: validate an edge just consumed at `edge_offset` against
    /// the snapshot. Returns `false` when the walk must be restarted.
    pub fn reader_verify(&self, snapshot: &mut LockFreeSnapshot, edge_offset: u64) -> bool {
        if snapshot.modify_flag != 0 && snapshot.offset == edge_offset {
            return false;
        }

        let counter = self.counter.load(Ordering::Acquire);
        if counter != snapshot.counter {
            let delta = counter.wrapping_sub(snapshot.counter);
            if delta as usize > MAX_OFFSET_CACHE {
                return false;
            }
            for i in 0..delta {
                let slot = snapshot.counter.wrapping_add(i) as usize % MAX_OFFSET_CACHE;
                if self.offset_cache[slot].load(Ordering::Relaxed) == edge_offset {
                    return false;
                }
            }
        }

        // Re-arm the snapshot so the next verify in the same walk compares
        // against the writer's latest publication.
        snapshot.modify_flag = self.modify_flag.load(Ordering::Acquire);
        snapshot.counter = counter;
        snapshot.offset = self.offset.load(Ordering::Acquire);
        if snapshot.modify_flag != 0 && snapshot.offset == edge_offset {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> LockFreeShm {
        // SAFETY: LockFreeShm is repr(C) atomics only; the all-zero pattern
        // is its initial state, same as a freshly created header file.
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn quiescent_verify_passes() {
        let shm = fresh();
        let mut snap = shm.reader_start();

        assert!(shm.reader_verify(&mut snap, 1234));
    }

    #[test]
    fn in_progress_write_on_same_edge_fails_verify() {
        let shm = fresh();
        shm.writer_start(500);
        let mut snap = shm.reader_start();

        assert!(!shm.reader_verify(&mut snap, 500));
        assert!(shm.reader_verify(&mut snap, 700));
    }

    #[test]
    fn committed_write_on_observed_edge_fails_verify() {
        let shm = fresh();
        let mut snap = shm.reader_start();

        shm.writer_start(500);
        shm.writer_stop();

        assert!(!shm.reader_verify(&mut snap, 500));
    }

    #[test]
    fn committed_write_elsewhere_passes_verify() {
        let shm = fresh();
        let mut snap = shm.reader_start();

        shm.writer_start(500);
        shm.writer_stop();

        assert!(shm.reader_verify(&mut snap, 700));
    }

    #[test]
    fn counter_past_window_fails_conservatively() {
        let shm = fresh();
        let mut snap = shm.reader_start();

        for i in 0..(MAX_OFFSET_CACHE as u64 + 1) {
            shm.writer_start(1000 + i * 8);
            shm.writer_stop();
        }

        assert!(!shm.reader_verify(&mut snap, 9999));
    }

    #[test]
    fn verify_rearms_snapshot_for_next_edge() {
        let shm = fresh();
        let mut snap = shm.reader_start();

        shm.writer_start(500);
        shm.writer_stop();
        assert!(shm.reader_verify(&mut snap, 700));

        // The write at 500 happened before the re-armed snapshot; a later
        // edge at a different offset is still valid.
        assert!(shm.reader_verify(&mut snap, 900));
    }
}
