use super::{closing_barrier, member, SYNC_VALUE};
use crate::progress::Comparator;
use crate::shmem_arch::ActiveSet;
use crate::shmem_rt::ShmemRT;
use crate::symmetric::{SymAddr, SymmetricPtr};

use tracing::trace;

/// Variable length gather through a wavefront prefix sum.
///
/// The first member starts at byte offset 0. Every other member waits for its left neighbour to
/// deposit the running offset in its `psync[0]`, passes `offset + nbytes` on to its right neighbour,
/// and then scatters its own contribution to that offset in every member's target. Offsets are never
/// negative, so they cannot be confused with [SYNC_VALUE].
pub(crate) fn wavefront(
    rt: &ShmemRT,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    set: &ActiveSet,
    me: usize,
    psync: SymmetricPtr<i64>,
) {
    let cell = psync.elem(0);
    let offset = if me == 0 {
        0
    } else {
        let offset = rt.wait_i64(cell, Comparator::Ne, SYNC_VALUE);
        rt.put_i64(rt.my_pe, cell, SYNC_VALUE);
        offset as usize
    };
    if me + 1 < set.size() {
        let next = (offset + nbytes) as i64;
        debug_assert_ne!(next, SYNC_VALUE, "collect offset collides with the pSync sentinel");
        rt.put_i64(member(set, me + 1), cell, next);
    }
    if nbytes > 0 {
        let data = rt.get_vec(rt.my_pe, src, nbytes);
        for pe in set.iter() {
            rt.put_bytes(pe, dest.byte_add(offset), &data);
        }
    }
    trace!("pe {} collected {} bytes at offset {}", rt.my_pe, nbytes, offset);
    rt.quiet();
    closing_barrier(rt, set, me, psync.offset(1));
}

/// Fixed length gather: member `i` writes its block at `i * nbytes` of every target.
pub(crate) fn fcollect_linear(
    rt: &ShmemRT,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    set: &ActiveSet,
    me: usize,
    psync: SymmetricPtr<i64>,
) {
    if nbytes > 0 {
        let data = rt.get_vec(rt.my_pe, src, nbytes);
        for pe in set.iter() {
            rt.put_bytes(pe, dest.byte_add(me * nbytes), &data);
        }
    }
    rt.quiet();
    closing_barrier(rt, set, me, psync.offset(1));
}
