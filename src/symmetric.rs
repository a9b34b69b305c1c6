//! Symmetric addressing.
//!
//! Every PE owns a symmetric heap segment and a static segment of the same size as everyone else's.
//! Objects are named by a [SymAddr] (segment + byte offset), which is meaningful on every PE; the
//! transport resolves it against the target's own segment. [SegmentTable] keeps the {base, size}
//! of every PE's segments for raw address translation.
use crate::error::ShmemError;

pub(crate) mod heap;

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Which symmetric segment an address lives in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentId {
    /// dynamically allocated with `malloc`/`memalign`/`realloc`
    Heap,
    /// statically symmetric variables, see [ShmemWorld::declare_static][crate::ShmemWorld::declare_static]
    Static,
}

/// A symmetric address: the same (segment, offset) names the same object on every PE.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymAddr {
    pub segment: SegmentId,
    pub offset: usize,
}

impl SymAddr {
    pub fn new(segment: SegmentId, offset: usize) -> SymAddr {
        SymAddr { segment, offset }
    }

    /// the address `bytes` further into the same segment
    pub fn byte_add(&self, bytes: usize) -> SymAddr {
        SymAddr {
            segment: self.segment,
            offset: self.offset + bytes,
        }
    }
}

/// A typed handle to `len` elements of symmetric memory.
///
/// The handle itself is plain data; it can be copied freely and sent to other PEs, where it names
/// their own copy of the object.
pub struct SymmetricPtr<T> {
    addr: SymAddr,
    len: usize,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for SymmetricPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SymmetricPtr<T> {}

impl<T> PartialEq for SymmetricPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.len == other.len
    }
}

impl<T> Eq for SymmetricPtr<T> {}

impl<T> std::fmt::Debug for SymmetricPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SymmetricPtr<{}>({:?}+{}, len {})",
            std::any::type_name::<T>(),
            self.addr.segment,
            self.addr.offset,
            self.len
        )
    }
}

impl<T> SymmetricPtr<T> {
    pub(crate) fn from_addr(addr: SymAddr, len: usize) -> SymmetricPtr<T> {
        SymmetricPtr {
            addr,
            len,
            _phantom: PhantomData,
        }
    }

    pub fn addr(&self) -> SymAddr {
        self.addr
    }

    /// number of elements
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// address of element `index`
    ///
    /// # Panics
    /// if `index` is past the end of the object
    pub fn elem(&self, index: usize) -> SymAddr {
        assert!(index < self.len, "index {} out of bounds (len {})", index, self.len);
        self.addr.byte_add(index * std::mem::size_of::<T>())
    }

    /// the `len` elements starting at `start`
    ///
    /// # Panics
    /// if the range is not inside the object
    pub fn sub(&self, start: usize, len: usize) -> SymmetricPtr<T> {
        assert!(
            start + len <= self.len,
            "sub range {}..{} out of bounds (len {})",
            start,
            start + len,
            self.len
        );
        SymmetricPtr::from_addr(self.addr.byte_add(start * std::mem::size_of::<T>()), len)
    }

    /// everything from element `start` onwards
    pub fn offset(&self, start: usize) -> SymmetricPtr<T> {
        self.sub(start, self.len - start.min(self.len))
    }

    /// Reinterpret the bytes as elements of `U`
    ///
    /// # Safety
    /// every bit pattern of the bytes must be a valid `U`, and the address must be aligned for `U`
    pub unsafe fn cast<U>(&self) -> SymmetricPtr<U> {
        SymmetricPtr::from_addr(self.addr, self.size_in_bytes() / std::mem::size_of::<U>())
    }
}

/// {base, size} of one segment of one PE.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentInfo {
    pub(crate) segment: SegmentId,
    pub(crate) base: usize,
    pub(crate) size: usize,
}

impl SegmentInfo {
    fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr <= self.base + self.size
    }
}

/// The {base, size} of every PE's segments, filled in by the segment exchange at init.
#[derive(Debug, Clone)]
pub(crate) struct SegmentTable {
    my_pe: usize,
    heap: Vec<Option<SegmentInfo>>,
    statics: Vec<Option<SegmentInfo>>,
}

impl SegmentTable {
    pub(crate) fn new(my_pe: usize, num_pes: usize) -> SegmentTable {
        SegmentTable {
            my_pe,
            heap: vec![None; num_pes],
            statics: vec![None; num_pes],
        }
    }

    pub(crate) fn insert(&mut self, pe: usize, info: SegmentInfo) {
        match info.segment {
            SegmentId::Heap => self.heap[pe] = Some(info),
            SegmentId::Static => self.statics[pe] = Some(info),
        }
    }

    pub(crate) fn get(&self, pe: usize, segment: SegmentId) -> Option<SegmentInfo> {
        match segment {
            SegmentId::Heap => self.heap.get(pe).copied().flatten(),
            SegmentId::Static => self.statics.get(pe).copied().flatten(),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.heap.iter().all(Option::is_some) && self.statics.iter().all(Option::is_some)
    }

    /// every pe must have registered segments of the same sizes
    pub(crate) fn check_sizes(&self) -> Result<(), ShmemError> {
        for table in [&self.heap, &self.statics] {
            let expected = table[self.my_pe].map(|i| i.size).unwrap_or(0);
            for (pe, info) in table.iter().enumerate() {
                let size = info.map(|i| i.size).unwrap_or(0);
                if size != expected {
                    return Err(ShmemError::SegmentMismatch { pe, size, expected });
                }
            }
        }
        Ok(())
    }

    /// Map a local heap address to the corresponding address on `pe`.
    ///
    /// Addresses in the static segment name the same variable everywhere and are returned unchanged.
    /// Anything outside `[base, base+size]` of the local heap is an error.
    pub(crate) fn translate(&self, local_addr: usize, pe: usize) -> Result<usize, ShmemError> {
        if let Some(statics) = self.statics[self.my_pe] {
            if statics.contains(local_addr) {
                return Ok(local_addr);
            }
        }
        let mine = self.heap[self.my_pe].ok_or(ShmemError::Finalized)?;
        if !mine.contains(local_addr) {
            return Err(self.raw_out_of_segment(pe, local_addr));
        }
        let theirs = self
            .heap
            .get(pe)
            .copied()
            .flatten()
            .ok_or(ShmemError::PeOutOfRange {
                pe,
                num_pes: self.heap.len(),
            })?;
        Ok(theirs.base + (local_addr - mine.base))
    }

    /// Inverse of [translate][Self::translate]: map an address on `pe` back to the local heap.
    pub(crate) fn to_local(&self, remote_addr: usize, pe: usize) -> Result<usize, ShmemError> {
        if let Some(statics) = self.statics[self.my_pe] {
            if statics.contains(remote_addr) {
                return Ok(remote_addr);
            }
        }
        let theirs = self
            .heap
            .get(pe)
            .copied()
            .flatten()
            .ok_or(ShmemError::PeOutOfRange {
                pe,
                num_pes: self.heap.len(),
            })?;
        if !theirs.contains(remote_addr) {
            return Err(self.raw_out_of_segment(pe, remote_addr));
        }
        let mine = self.heap[self.my_pe].ok_or(ShmemError::Finalized)?;
        Ok(mine.base + (remote_addr - theirs.base))
    }

    /// the symmetric address of a local pointer, if it lies in one of the local segments
    pub(crate) fn sym_addr(&self, local_addr: usize) -> Option<SymAddr> {
        [self.heap[self.my_pe], self.statics[self.my_pe]]
            .into_iter()
            .flatten()
            .find(|info| info.contains(local_addr))
            .map(|info| SymAddr::new(info.segment, local_addr - info.base))
    }

    fn raw_out_of_segment(&self, pe: usize, addr: usize) -> ShmemError {
        ShmemError::OutOfSegment {
            pe,
            addr: SymAddr::new(SegmentId::Heap, addr),
            len: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(my_pe: usize) -> SegmentTable {
        let mut table = SegmentTable::new(my_pe, 3);
        for (pe, base) in [0x1000usize, 0x9000, 0x5000].into_iter().enumerate() {
            table.insert(
                pe,
                SegmentInfo {
                    segment: SegmentId::Heap,
                    base,
                    size: 0x800,
                },
            );
            table.insert(
                pe,
                SegmentInfo {
                    segment: SegmentId::Static,
                    base: 0x100_0000 + pe * 0x100,
                    size: 0x40,
                },
            );
        }
        table
    }

    #[test]
    fn translation_round_trips_for_every_pair() {
        for me in 0..3 {
            let t = table(me);
            let base = t.get(me, SegmentId::Heap).unwrap().base;
            for a in [base, base + 8, base + 0x7ff, base + 0x800] {
                for q in 0..3 {
                    let remote = t.translate(a, q).unwrap();
                    assert_eq!(t.to_local(remote, q).unwrap(), a);
                }
                assert_eq!(t.translate(a, me).unwrap(), a);
            }
        }
    }

    #[test]
    fn translation_offsets_are_preserved() {
        let t = table(0);
        assert_eq!(t.translate(0x1010, 1).unwrap(), 0x9010);
        assert_eq!(t.translate(0x1010, 2).unwrap(), 0x5010);
    }

    #[test]
    fn addresses_outside_the_heap_fail() {
        let t = table(0);
        assert!(t.translate(0x0fff, 1).is_err());
        assert!(t.translate(0x1801, 1).is_err());
        assert!(t.translate(0x1010, 7).is_err());
    }

    #[test]
    fn static_addresses_are_not_translated() {
        let t = table(1);
        let global = 0x100_0100 + 0x10;
        assert_eq!(t.translate(global, 0).unwrap(), global);
        assert_eq!(t.sym_addr(global), Some(SymAddr::new(SegmentId::Static, 0x10)));
        assert_eq!(t.sym_addr(0x9008), Some(SymAddr::new(SegmentId::Heap, 8)));
        assert_eq!(t.sym_addr(0x42), None);
    }

    #[test]
    fn size_mismatch_is_detected() {
        let mut t = table(0);
        assert!(t.check_sizes().is_ok());
        t.insert(
            2,
            SegmentInfo {
                segment: SegmentId::Heap,
                base: 0x5000,
                size: 0x400,
            },
        );
        match t.check_sizes() {
            Err(ShmemError::SegmentMismatch { pe, size, expected }) => {
                assert_eq!((pe, size, expected), (2, 0x400, 0x800));
            }
            other => panic!("expected a mismatch, got {:?}", other),
        }
    }

    #[test]
    fn typed_pointers_index_by_element() {
        let p = SymmetricPtr::<u64>::from_addr(SymAddr::new(SegmentId::Heap, 64), 10);
        assert_eq!(p.elem(3), SymAddr::new(SegmentId::Heap, 88));
        let s = p.sub(2, 4);
        assert_eq!(s.len(), 4);
        assert_eq!(s.addr().offset, 80);
        assert_eq!(p.offset(10).len(), 0);
        let bytes = unsafe { p.cast::<u8>() };
        assert_eq!(bytes.len(), 80);
    }
}
