//! Distributed MCS queue lock.
//!
//! A [ShmemLock] is 16 symmetric bytes. The first 8 are the global tail word; only the copy on the
//! lock's owner pe (a hash of the lock's address) is used. It packs `{locked: u32, next: i32}` with
//! `locked` in the high half, `next` being the pe at the end of the queue or [FREE]. The last 8 bytes
//! are the calling pe's own queue node, `{locked: u32, next: i32}` at offsets 8 and 12.
//!
//! All cross-pe updates of the lock go through the remote atomics so they are serialized at the
//! cell's owner.
use crate::atomic::AtomicOp;
use crate::shmem_rt::ShmemRT;
use crate::symmetric::{SymAddr, SymmetricPtr};

use tracing::trace;

/// `next` value meaning "nobody"
pub(crate) const FREE: i32 = -1;
/// the tail word of a free lock: not locked, nobody queued
pub(crate) const RESET: u64 = tail_word(0, FREE);

const NODE_LOCKED: usize = 8;
const NODE_NEXT: usize = 12;

const fn tail_word(locked: u32, next: i32) -> u64 {
    ((locked as u64) << 32) | (next as u32 as u64)
}

fn tail_next(word: u64) -> i32 {
    word as u32 as i32
}

/// A distributed lock living in symmetric memory.
///
/// Created collectively with [new_lock][crate::ShmemWorld::new_lock] (or declared statically with
/// [declare_static_lock][crate::ShmemWorld::declare_static_lock]); the handle is plain data and names
/// the same lock on every pe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmemLock {
    ptr: SymmetricPtr<u64>,
}

impl ShmemLock {
    /// bytes of symmetric memory a lock occupies
    pub const SIZE: usize = 16;

    pub(crate) fn from_ptr(ptr: SymmetricPtr<u64>) -> ShmemLock {
        ShmemLock { ptr }
    }

    pub(crate) fn ptr(&self) -> SymmetricPtr<u64> {
        self.ptr
    }

    fn tail(&self) -> SymAddr {
        self.ptr.addr()
    }

    fn node_locked(&self) -> SymAddr {
        self.ptr.addr().byte_add(NODE_LOCKED)
    }

    fn node_next(&self) -> SymAddr {
        self.ptr.addr().byte_add(NODE_NEXT)
    }

    /// pe holding the authoritative tail word
    pub(crate) fn owner(&self, num_pes: usize) -> usize {
        let addr = self.ptr.addr();
        let hash = (addr.offset >> 3) ^ (addr.segment as usize);
        hash % num_pes
    }
}

impl ShmemRT {
    fn normalize_tail(&self, word: u64) -> u64 {
        if self.config.lock_legacy_zero && word == 0 {
            RESET
        } else {
            word
        }
    }

    /// initialize the calling pe's copy of `lock` to the free state
    pub(crate) fn lock_init(&self, lock: &ShmemLock) {
        self.put_word(self.my_pe, lock.tail(), 8, RESET as u128);
        self.put_word(self.my_pe, lock.node_locked(), 4, 0);
        self.put_word(self.my_pe, lock.node_next(), 4, FREE as u32 as u128);
    }

    fn swap_tail(&self, lock: &ShmemLock, word: u64) -> u64 {
        let owner = lock.owner(self.num_pes);
        self.atomic_fetch_op(owner, lock.tail(), AtomicOp::Swap, 8, word as u128, 0) as u64
    }

    fn cswap_tail(&self, lock: &ShmemLock, cond: u64, word: u64) -> u64 {
        let owner = lock.owner(self.num_pes);
        let prev = self.atomic_fetch_op(
            owner,
            lock.tail(),
            AtomicOp::Cswap,
            8,
            word as u128,
            cond as u128,
        );
        prev as u64
    }

    fn node_next_value(&self, lock: &ShmemLock) -> i32 {
        self.get_word(self.my_pe, lock.node_next(), 4) as u32 as i32
    }

    /// link behind `prev` in the queue and wait for the hand off
    fn enqueue_behind(&self, lock: &ShmemLock, prev: i32) {
        trace!("pe {} queued behind pe {} on {:?}", self.my_pe, prev, lock);
        let me = self.my_pe as u32 as u128;
        self.atomic_fetch_op(prev as usize, lock.node_next(), AtomicOp::Swap, 4, me, 0);
        self.wait_word(lock.node_locked(), 4, "a lock acquire", |locked| locked == 0);
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn set_lock(&self, lock: &ShmemLock) {
        self.check_live();
        // nobody can reach our node before our rank is in the tail
        self.put_word(self.my_pe, lock.node_locked(), 4, 1);
        self.put_word(self.my_pe, lock.node_next(), 4, FREE as u32 as u128);
        let request = tail_word(1, self.my_pe as i32);
        let prev = self.normalize_tail(self.swap_tail(lock, request));
        let prev_pe = tail_next(prev);
        if prev_pe != FREE {
            self.enqueue_behind(lock, prev_pe);
        }
        trace!("pe {} holds {:?}", self.my_pe, lock);
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn clear_lock(&self, lock: &ShmemLock) {
        self.check_live();
        // writes made under the lock must land before the next holder enters
        self.quiet();
        if self.node_next_value(lock) == FREE {
            let mine = tail_word(1, self.my_pe as i32);
            let seen = self.cswap_tail(lock, mine, RESET);
            if seen == mine {
                trace!("pe {} released {:?}", self.my_pe, lock);
                return;
            }
            // a successor swapped itself in but has not linked yet
            self.wait_word(lock.node_next(), 4, "a lock release", |next| {
                next as u32 as i32 != FREE
            });
        }
        let succ = self.node_next_value(lock);
        self.atomic_fetch_op(succ as usize, lock.node_locked(), AtomicOp::Swap, 4, 0, 0);
        trace!("pe {} handed {:?} to pe {}", self.my_pe, lock, succ);
    }

    /// Acquire `lock` only if nobody holds it; returns true if it was acquired.
    #[tracing::instrument(skip(self))]
    pub(crate) fn test_lock(&self, lock: &ShmemLock) -> bool {
        self.check_live();
        let owner = lock.owner(self.num_pes);
        let observed = self.atomic_fetch_op(owner, lock.tail(), AtomicOp::Fetch, 8, 0, 0) as u64;
        if tail_next(self.normalize_tail(observed)) != FREE {
            return false;
        }
        self.put_word(self.my_pe, lock.node_locked(), 4, 1);
        self.put_word(self.my_pe, lock.node_next(), 4, FREE as u32 as u128);
        let request = tail_word(1, self.my_pe as i32);
        self.cswap_tail(lock, observed, request) == observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symmetric::SegmentId;

    #[test]
    fn tail_words_pack_locked_and_next() {
        assert_eq!(RESET, 0x0000_0000_ffff_ffff);
        assert_eq!(tail_next(RESET), FREE);
        let word = tail_word(1, 5);
        assert_eq!(word, 0x0000_0001_0000_0005);
        assert_eq!(tail_next(word), 5);
        assert_eq!(tail_next(0), 0);
    }

    #[test]
    fn owner_is_stable_and_in_range() {
        for offset in (0..512).step_by(16) {
            let addr = SymAddr::new(SegmentId::Heap, offset);
            let lock = ShmemLock::from_ptr(SymmetricPtr::from_addr(addr, 2));
            for n in 1..9 {
                let owner = lock.owner(n);
                assert!(owner < n);
                assert_eq!(owner, lock.owner(n));
            }
        }
    }
}
