//! The collective symmetric allocator.
//!
//! Every pe runs an identical [BTreeAlloc][crate::shmem_alloc::BTreeAlloc] over the offsets of its
//! heap segment. As long as every pe makes the same sequence of calls with the same sizes, the same
//! offsets come out everywhere, which is what makes a returned [SymAddr] symmetric. When the symmetric
//! check is on, the requested size is broadcast from the first pe and the verdict is agreed on by an
//! AND reduction before the heap is touched.
use crate::collectives::reduce;
use crate::error::{MallocError, MallocResult, MallocStatus};
use crate::shmem_alloc::FreeError;
use crate::shmem_arch::ActiveSet;
use crate::shmem_rt::ShmemRT;
use crate::symmetric::{SegmentId, SymAddr};

use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Alignment of blocks handed out by `malloc` and `realloc`
pub(crate) const DEFAULT_ALIGN: usize = 16;

impl ShmemRT {
    pub(crate) fn malloc_status(&self) -> MallocStatus {
        MallocStatus::from_u8(self.last_error.load(Ordering::Acquire))
    }

    /// record `status` in the last-error cell, turning anything but `Ok` into an error
    fn report<T>(&self, status: MallocStatus, val: T) -> MallocResult<T> {
        self.last_error.store(status.code(), Ordering::Release);
        if status == MallocStatus::Ok {
            Ok(val)
        } else {
            debug!("pe {} {}: {}", self.my_pe, self.heap.id(), status);
            Err(MallocError(status))
        }
    }

    /// true when every pe asked for the same `size` as the first pe
    fn sizes_agree(&self, size: usize) -> bool {
        let world = ActiveSet::world(self.num_pes);
        let s = self.scratch;
        self.put_i64(self.my_pe, s.size_src.elem(0), size as i64);
        (self.algorithms.broadcast.1)(
            self,
            s.size_dst.addr(),
            s.size_src.addr(),
            std::mem::size_of::<i64>(),
            0,
            &world,
            self.my_pe,
            s.bcast_psync,
        );
        // the root's target is not written by a broadcast
        let agree = self.my_pe == 0 || self.get_i64(self.my_pe, s.size_dst.elem(0)) == size as i64;
        if !agree {
            warn!(
                "pe {} asked for {} symmetric bytes, pe 0 for {}",
                self.my_pe,
                size,
                self.get_i64(self.my_pe, s.size_dst.elem(0))
            );
        }
        self.put_i64(self.my_pe, s.vote_src.elem(0), agree as i64);
        reduce::to_all(
            self,
            s.vote_dst,
            s.vote_src,
            1,
            &world,
            self.my_pe,
            s.reduce_psync,
            |a: i64, b: i64| a & b,
        );
        self.get_i64(self.my_pe, s.vote_dst.elem(0)) != 0
    }

    /// checks shared by the allocating calls, `Ok` means the heap may be touched
    fn admit(&self, size: usize) -> MallocStatus {
        if self.config.symmetric_check && !self.sizes_agree(size) {
            MallocStatus::SymmsizeFailed
        } else if size == 0 {
            MallocStatus::BadSize
        } else {
            MallocStatus::Ok
        }
    }

    fn allocate(&self, size: usize, align: usize, failure: MallocStatus) -> MallocResult<SymAddr> {
        self.check_live();
        let mut status = self.admit(size);
        let mut addr = SymAddr::new(SegmentId::Heap, 0);
        if status == MallocStatus::Ok {
            match self.heap.try_malloc(size, align) {
                Some(offset) => addr.offset = offset,
                None => status = failure,
            }
        }
        self.barrier_all();
        self.report(status, addr)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn malloc_bytes(&self, size: usize) -> MallocResult<SymAddr> {
        self.allocate(size, DEFAULT_ALIGN, MallocStatus::Fail)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn memalign_bytes(&self, align: usize, size: usize) -> MallocResult<SymAddr> {
        if !align.is_power_of_two() {
            self.check_live();
            self.barrier_all();
            return self.report(MallocStatus::NotAligned, SymAddr::new(SegmentId::Heap, 0));
        }
        self.allocate(size, align, MallocStatus::MemalignFailed)
    }

    /// Move the block at `addr` to a new block of `size` bytes, keeping the common prefix.
    #[tracing::instrument(skip(self))]
    pub(crate) fn realloc_bytes(&self, addr: SymAddr, size: usize) -> MallocResult<SymAddr> {
        self.check_live();
        let mut status = self.admit(size);
        let mut new_addr = addr;
        if status == MallocStatus::Ok {
            let old_size = match addr.segment {
                SegmentId::Heap => self.heap.size_of(addr.offset),
                SegmentId::Static => None,
            };
            match old_size {
                None => status = MallocStatus::NotInSymmHeap,
                Some(old_size) => match self.heap.try_malloc(size, DEFAULT_ALIGN) {
                    Some(offset) => {
                        new_addr = SymAddr::new(SegmentId::Heap, offset);
                        let keep = old_size.min(size);
                        let data = self.get_vec(self.my_pe, addr, keep);
                        self.put_bytes(self.my_pe, new_addr, &data);
                        if let Err(e) = self.heap.free(addr.offset) {
                            warn!(
                                "pe {} realloc could not release {:?}: {:?}",
                                self.my_pe, addr, e
                            );
                        }
                    }
                    None => status = MallocStatus::ReallocFailed,
                },
            }
        }
        self.barrier_all();
        self.report(status, new_addr)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn free_bytes(&self, addr: SymAddr) -> MallocResult<()> {
        self.check_live();
        // nobody may still be touching the block on another pe
        self.barrier_all();
        let status = match addr.segment {
            SegmentId::Static => MallocStatus::NotInSymmHeap,
            SegmentId::Heap => match self.heap.free(addr.offset) {
                Ok(_) => MallocStatus::Ok,
                Err(FreeError::NotManaged(_)) => MallocStatus::NotInSymmHeap,
                Err(FreeError::NotAllocated(_)) => MallocStatus::AlreadyFree,
            },
        };
        self.report(status, ())
    }

    /// Reserve `size` zeroed bytes of the static segment.
    ///
    /// Not collective: like a global variable, every pe must declare the same statics in the same order.
    pub(crate) fn declare_static_bytes(&self, size: usize, align: usize) -> MallocResult<SymAddr> {
        self.check_live();
        let align = align.max(8);
        let mut next = self.statics_next.lock();
        let start = (*next + align - 1) & !(align - 1);
        if size == 0 {
            return self.report(MallocStatus::BadSize, SymAddr::new(SegmentId::Static, start));
        }
        if start + size > self.static_size {
            return self.report(MallocStatus::Fail, SymAddr::new(SegmentId::Static, start));
        }
        *next = start + size;
        self.report(MallocStatus::Ok, SymAddr::new(SegmentId::Static, start))
    }

    /// bytes of the heap currently handed out on this pe
    pub(crate) fn heap_in_use(&self) -> usize {
        self.heap.occupied()
    }

    pub(crate) fn heap_size(&self) -> usize {
        self.heap.max_size()
    }
}
