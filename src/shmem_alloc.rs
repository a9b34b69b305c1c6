use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Why a free was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeError {
    /// the address lies outside the managed range
    NotManaged(usize),
    /// the address is inside the range but is not the start of a live allocation
    NotAllocated(usize),
}

#[derive(Clone, Debug)]
struct FreeEntries {
    sizes: BTreeMap<usize, IndexSet<usize>>, //<size,<Vec<addr>>
    addrs: BTreeMap<usize, usize>,           //<addr,size>
}

impl FreeEntries {
    fn new() -> FreeEntries {
        FreeEntries {
            sizes: BTreeMap::new(),
            addrs: BTreeMap::new(),
        }
    }

    fn insert(&mut self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        self.addrs.insert(addr, size);
        self.sizes.entry(size).or_insert_with(IndexSet::new).insert(addr);
    }

    fn remove(&mut self, addr: usize, size: usize) {
        self.addrs.remove(&addr);
        let mut remove_size = false;
        if let Some(addrs) = self.sizes.get_mut(&size) {
            addrs.shift_remove(&addr);
            remove_size = addrs.is_empty();
        }
        if remove_size {
            self.sizes.remove(&size);
        }
    }
}

fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Best fit allocator over one contiguous offset range.
///
/// Free blocks are indexed by size (then insertion order) so the smallest block that can hold a request
/// is chosen, and adjacent blocks are coalesced on free. Given the same sequence of calls it hands out
/// the same offsets, which keeps allocations symmetric across PEs.
#[derive(Debug)]
pub(crate) struct BTreeAlloc {
    free_entries: Mutex<FreeEntries>,
    allocated_addrs: Mutex<BTreeMap<usize, usize>>, //<addr,size>
    start_addr: usize,
    max_size: usize,
    id: String,
}

impl BTreeAlloc {
    pub(crate) fn new(id: String) -> BTreeAlloc {
        BTreeAlloc {
            free_entries: Mutex::new(FreeEntries::new()),
            allocated_addrs: Mutex::new(BTreeMap::new()),
            start_addr: 0,
            max_size: 0,
            id,
        }
    }

    pub(crate) fn init(&mut self, start_addr: usize, size: usize) {
        self.start_addr = start_addr;
        self.max_size = size;
        let mut free_entries = self.free_entries.lock();
        *free_entries = FreeEntries::new();
        free_entries.insert(start_addr, size);
        self.allocated_addrs.lock().clear();
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    /// true if `addr` lies inside the managed range
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.start_addr <= addr && addr < self.start_addr + self.max_size
    }

    /// `align` must be a power of two
    pub(crate) fn try_malloc(&self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        if size == 0 {
            return None;
        }
        let mut free_entries = self.free_entries.lock();
        //find smallest memory segment greater than or equal to size that has room after alignment
        let mut found: Option<(usize, usize, usize)> = None; //(free addr, free size, aligned addr)
        'search: for (free_size, addrs) in free_entries.sizes.range(size..) {
            for addr in addrs.iter().rev() {
                let aligned = align_up(*addr, align);
                if aligned + size <= addr + free_size {
                    found = Some((*addr, *free_size, aligned));
                    break 'search;
                }
            }
        }
        let (faddr, fsize, aligned) = found?;
        free_entries.remove(faddr, fsize);
        free_entries.insert(faddr, aligned - faddr);
        free_entries.insert(aligned + size, faddr + fsize - (aligned + size));
        drop(free_entries);
        self.allocated_addrs.lock().insert(aligned, size);
        Some(aligned)
    }

    /// size of the live allocation starting at `addr`
    pub(crate) fn size_of(&self, addr: usize) -> Option<usize> {
        self.allocated_addrs.lock().get(&addr).copied()
    }

    /// returns the size of the freed block
    pub(crate) fn free(&self, addr: usize) -> Result<usize, FreeError> {
        if !self.contains(addr) {
            return Err(FreeError::NotManaged(addr));
        }
        let size = self
            .allocated_addrs
            .lock()
            .remove(&addr)
            .ok_or(FreeError::NotAllocated(addr))?;
        let mut temp_addr = addr;
        let mut temp_size = size;
        let mut remove: Vec<(usize, usize)> = vec![];
        let mut free_entries = self.free_entries.lock();
        if let Some((faddr, fsize)) = free_entries.addrs.range(..addr).next_back() {
            //look at address before addr
            if faddr + fsize == addr {
                //they are next to eachother...
                temp_addr = *faddr;
                temp_size = fsize + size;
                remove.push((*faddr, *fsize));
            }
        }
        if let Some((faddr, fsize)) = free_entries.addrs.range(addr..).next() {
            //look at address after addr
            if temp_addr + temp_size == *faddr {
                temp_size += fsize;
                remove.push((*faddr, *fsize));
            }
        }
        for (raddr, rsize) in remove {
            free_entries.remove(raddr, rsize);
        }
        free_entries.insert(temp_addr, temp_size);
        Ok(size)
    }

    /// bytes currently handed out
    pub(crate) fn occupied(&self) -> usize {
        self.allocated_addrs.lock().values().sum()
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(size: usize) -> BTreeAlloc {
        let mut alloc = BTreeAlloc::new("test".to_string());
        alloc.init(0, size);
        alloc
    }

    #[test]
    fn test_bttreealloc_malloc_free() {
        let alloc = alloc(1000);
        assert_eq!(alloc.try_malloc(50, 1), Some(0));
        assert_eq!(alloc.try_malloc(10, 1), Some(50));
        assert_eq!(alloc.try_malloc(600, 1), Some(60));
        assert_eq!(alloc.try_malloc(10, 1), Some(660));
        assert_eq!(alloc.free(0), Ok(50));
        assert_eq!(alloc.try_malloc(30, 1), Some(0));
        assert_eq!(alloc.free(50), Ok(10));
        // best fit: the 30 byte hole at [30,60) beats the tail
        assert_eq!(alloc.try_malloc(10, 1), Some(30));
        assert_eq!(alloc.try_malloc(10, 1), Some(40));
        assert_eq!(alloc.free(660), Ok(10));
        assert_eq!(alloc.try_malloc(200, 1), Some(660));
        for addr in [60, 660, 40, 30, 0] {
            assert!(alloc.free(addr).is_ok());
        }
        assert_eq!(alloc.occupied(), 0);
        assert_eq!(alloc.try_malloc(1000, 1), Some(0));
        assert_eq!(alloc.try_malloc(1, 1), None);
    }

    #[test]
    fn test_bttreealloc_alignment() {
        let alloc = alloc(4096);
        assert_eq!(alloc.try_malloc(3, 1), Some(0));
        let a = alloc.try_malloc(8, 64).unwrap();
        assert_eq!(a % 64, 0);
        assert_eq!(a, 64);
        // the gap in front of the aligned block stays usable
        assert_eq!(alloc.try_malloc(61, 1), Some(3));
        assert_eq!(alloc.try_malloc(16, 4096), None);
    }

    #[test]
    fn test_bttreealloc_free_errors() {
        let alloc = alloc(256);
        let a = alloc.try_malloc(16, 16).unwrap();
        assert_eq!(alloc.free(a + 4), Err(FreeError::NotAllocated(a + 4)));
        assert_eq!(alloc.free(4096), Err(FreeError::NotManaged(4096)));
        assert_eq!(alloc.free(a), Ok(16));
        assert_eq!(alloc.free(a), Err(FreeError::NotAllocated(a)));
    }

    #[test]
    fn test_bttreealloc_is_deterministic() {
        let sizes = [24usize, 100, 7, 512, 64, 3, 250];
        let run = || {
            let alloc = alloc(1 << 14);
            let mut addrs = vec![];
            for (i, size) in sizes.iter().enumerate() {
                addrs.push(alloc.try_malloc(*size, 16).unwrap());
                if i % 3 == 2 {
                    alloc.free(addrs[i - 1]).unwrap();
                }
            }
            addrs
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_zero_sized_requests_fail() {
        let alloc = alloc(64);
        assert_eq!(alloc.try_malloc(0, 8), None);
    }
}
