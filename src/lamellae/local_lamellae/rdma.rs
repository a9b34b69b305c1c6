use super::am::Command;
use super::mem::{self, SegmentMem};
use super::Local;
use crate::lamellae::error::{RdmaError, RdmaResult};
use crate::lamellae::LamellaeRDMA;
use crate::progress::CompletionFlag;
use crate::symmetric::{SegmentId, SymAddr};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

impl Local {
    fn resolve(&self, pe: usize, addr: SymAddr, len: usize) -> RdmaResult<*mut u8> {
        if pe >= self.fabric.num_pes() {
            return Err(RdmaError::PeOutOfRange {
                pe,
                num_pes: self.fabric.num_pes(),
            });
        }
        let seg = self
            .fabric
            .segment(pe, addr.segment)
            .ok_or(RdmaError::NoSegment {
                pe,
                segment: addr.segment,
            })?;
        seg.range(addr.offset, len)
            .ok_or(RdmaError::OutOfBounds { pe, addr, len })
    }

    fn enqueue(&self, cmd: Command) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.outbox().send(cmd).is_err() {
            // service thread already gone, nothing will ever complete this transfer
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl LamellaeRDMA for Local {
    fn register_segment(&self, segment: SegmentId, size: usize) -> RdmaResult<usize> {
        let mem = SegmentMem::new(size).ok_or(RdmaError::NoSegment {
            pe: self.my_pe,
            segment,
        })?;
        let base = mem.base();
        trace!("pe {} registered {:?} segment {:?}", self.my_pe, segment, mem);
        self.fabric.slots[self.my_pe]
            .segments
            .write()
            .insert(segment, Arc::new(mem));
        Ok(base)
    }

    fn release_segments(&self) {
        self.fabric.slots[self.my_pe].segments.write().clear();
    }

    fn segment_info(&self, pe: usize, segment: SegmentId) -> RdmaResult<(usize, usize)> {
        self.fabric
            .segment(pe, segment)
            .map(|seg| (seg.base(), seg.size()))
            .ok_or(RdmaError::NoSegment { pe, segment })
    }

    fn put(&self, pe: usize, dst: SymAddr, src: &[u8]) -> RdmaResult<()> {
        let ptr = self.resolve(pe, dst, src.len())?;
        unsafe { mem::copy_in(ptr, src) };
        Ok(())
    }

    fn get(&self, pe: usize, src: SymAddr, dst: &mut [u8]) -> RdmaResult<()> {
        let ptr = self.resolve(pe, src, dst.len())?;
        unsafe { mem::copy_out(ptr, dst) };
        Ok(())
    }

    fn put_nb(
        &self,
        pe: usize,
        dst: SymAddr,
        src: Vec<u8>,
        done: Option<Arc<CompletionFlag>>,
    ) -> RdmaResult<()> {
        self.resolve(pe, dst, src.len())?;
        self.enqueue(Command::Put {
            pe,
            dst,
            data: src,
            done,
        });
        Ok(())
    }

    fn get_nb(
        &self,
        pe: usize,
        src: SymAddr,
        len: usize,
        dst: SymAddr,
        done: Option<Arc<CompletionFlag>>,
    ) -> RdmaResult<()> {
        self.resolve(pe, src, len)?;
        self.resolve(self.my_pe, dst, len)?;
        self.enqueue(Command::Get {
            pe,
            src,
            len,
            dst,
            done,
        });
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn atomic_load(&self, pe: usize, addr: SymAddr, width: usize) -> RdmaResult<u128> {
        let ptr = self.resolve(pe, addr, width)?;
        Ok(unsafe { mem::load(ptr, width) })
    }

    fn atomic_store(&self, pe: usize, addr: SymAddr, width: usize, val: u128) -> RdmaResult<()> {
        let ptr = self.resolve(pe, addr, width)?;
        unsafe { mem::store(ptr, width, val) };
        Ok(())
    }

    fn local_ptr(&self, addr: SymAddr, len: usize) -> RdmaResult<*mut u8> {
        self.resolve(self.my_pe, addr, len)
    }
}
