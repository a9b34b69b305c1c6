//! Segment memory of the local fabric.
//!
//! Remote pes touch a segment concurrently with its owner, so every access goes through atomics of the
//! widest width the alignment allows. A word written by a put is therefore never observed torn, and the
//! release/acquire fences around each copy order data ahead of any flag written after it.
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

const SEGMENT_ALIGN: usize = 4096;

pub(crate) struct SegmentMem {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// the memory is only ever accessed through the atomic helpers below
unsafe impl Send for SegmentMem {}
unsafe impl Sync for SegmentMem {}

impl std::fmt::Debug for SegmentMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SegmentMem({:#x}, {})", self.base(), self.size)
    }
}

impl SegmentMem {
    /// zero initialized, page aligned; None if the system allocator refuses
    pub(crate) fn new(size: usize) -> Option<SegmentMem> {
        let layout = Layout::from_size_align(size.max(SEGMENT_ALIGN), SEGMENT_ALIGN).ok()?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        Some(SegmentMem { ptr, size, layout })
    }

    pub(crate) fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// pointer to `len` bytes at `offset`, if they lie inside the segment
    pub(crate) fn range(&self, offset: usize, len: usize) -> Option<*mut u8> {
        let end = offset.checked_add(len)?;
        if end <= self.size {
            Some(unsafe { self.ptr.as_ptr().add(offset) })
        } else {
            None
        }
    }
}

impl Drop for SegmentMem {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

fn chunk_width(addr: usize, remaining: usize) -> usize {
    [8, 4, 2, 1]
        .into_iter()
        .find(|w| addr % w == 0 && remaining >= *w)
        .unwrap_or(1)
}

/// # Safety
/// `dst..dst+src.len()` must lie inside a live [SegmentMem]
pub(crate) unsafe fn copy_in(dst: *mut u8, src: &[u8]) {
    fence(Ordering::Release);
    let mut i = 0;
    while i < src.len() {
        let addr = dst.add(i);
        let w = chunk_width(addr as usize, src.len() - i);
        let bytes = &src[i..i + w];
        match w {
            8 => (*(addr as *const AtomicU64))
                .store(u64::from_ne_bytes(bytes.try_into().unwrap_or([0; 8])), Ordering::Relaxed),
            4 => (*(addr as *const AtomicU32))
                .store(u32::from_ne_bytes(bytes.try_into().unwrap_or([0; 4])), Ordering::Relaxed),
            2 => (*(addr as *const AtomicU16))
                .store(u16::from_ne_bytes(bytes.try_into().unwrap_or([0; 2])), Ordering::Relaxed),
            _ => (*(addr as *const AtomicU8)).store(bytes[0], Ordering::Relaxed),
        }
        i += w;
    }
}

/// # Safety
/// `src..src+dst.len()` must lie inside a live [SegmentMem]
pub(crate) unsafe fn copy_out(src: *const u8, dst: &mut [u8]) {
    let mut i = 0;
    while i < dst.len() {
        let addr = src.add(i);
        let w = chunk_width(addr as usize, dst.len() - i);
        match w {
            8 => dst[i..i + 8].copy_from_slice(
                &(*(addr as *const AtomicU64)).load(Ordering::Relaxed).to_ne_bytes(),
            ),
            4 => dst[i..i + 4].copy_from_slice(
                &(*(addr as *const AtomicU32)).load(Ordering::Relaxed).to_ne_bytes(),
            ),
            2 => dst[i..i + 2].copy_from_slice(
                &(*(addr as *const AtomicU16)).load(Ordering::Relaxed).to_ne_bytes(),
            ),
            _ => dst[i] = (*(addr as *const AtomicU8)).load(Ordering::Relaxed),
        }
        i += w;
    }
    fence(Ordering::Acquire);
}

/// Load a `width` byte word. Sixteen byte words are two eight byte halves.
///
/// # Safety
/// `ptr` must be aligned to `width` (8 for sixteen byte words) and inside a live [SegmentMem]
pub(crate) unsafe fn load(ptr: *const u8, width: usize) -> u128 {
    let val = match width {
        1 => (*(ptr as *const AtomicU8)).load(Ordering::Relaxed) as u128,
        2 => (*(ptr as *const AtomicU16)).load(Ordering::Relaxed) as u128,
        4 => (*(ptr as *const AtomicU32)).load(Ordering::Relaxed) as u128,
        8 => (*(ptr as *const AtomicU64)).load(Ordering::Relaxed) as u128,
        _ => {
            let first = (*(ptr as *const AtomicU64)).load(Ordering::Relaxed) as u128;
            let second = (*(ptr.add(8) as *const AtomicU64)).load(Ordering::Relaxed) as u128;
            if cfg!(target_endian = "little") {
                first | (second << 64)
            } else {
                (first << 64) | second
            }
        }
    };
    fence(Ordering::Acquire);
    val
}

/// # Safety
/// same as [load]
pub(crate) unsafe fn store(ptr: *mut u8, width: usize, val: u128) {
    fence(Ordering::Release);
    match width {
        1 => (*(ptr as *const AtomicU8)).store(val as u8, Ordering::Relaxed),
        2 => (*(ptr as *const AtomicU16)).store(val as u16, Ordering::Relaxed),
        4 => (*(ptr as *const AtomicU32)).store(val as u32, Ordering::Relaxed),
        8 => (*(ptr as *const AtomicU64)).store(val as u64, Ordering::Relaxed),
        _ => {
            let (first, second) = if cfg!(target_endian = "little") {
                (val as u64, (val >> 64) as u64)
            } else {
                ((val >> 64) as u64, val as u64)
            };
            (*(ptr as *const AtomicU64)).store(first, Ordering::Relaxed);
            (*(ptr.add(8) as *const AtomicU64)).store(second, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_copies_round_trip() {
        let seg = SegmentMem::new(64).unwrap();
        let src = (0u8..29).collect::<Vec<_>>();
        let ptr = seg.range(3, src.len()).unwrap();
        unsafe { copy_in(ptr, &src) };
        let mut dst = vec![0u8; src.len()];
        unsafe { copy_out(ptr, &mut dst) };
        assert_eq!(src, dst);
        assert!(seg.range(60, 5).is_none());
        assert!(seg.range(60, 4).is_some());
        assert!(seg.range(usize::MAX, 2).is_none());
    }

    #[test]
    fn words_of_every_width() {
        let seg = SegmentMem::new(64).unwrap();
        let ptr = seg.range(16, 16).unwrap();
        for (width, val) in [
            (1usize, 0xab_u128),
            (2, 0xbeef),
            (4, 0xdead_beef),
            (8, 0x0123_4567_89ab_cdef),
            (16, u128::MAX - 7),
        ] {
            unsafe { store(ptr, width, val) };
            assert_eq!(unsafe { load(ptr, width) }, val);
        }
        let mut bytes = [0u8; 16];
        unsafe { copy_out(ptr, &mut bytes) };
        assert_eq!(u128::from_ne_bytes(bytes), u128::MAX - 7);
    }
}
