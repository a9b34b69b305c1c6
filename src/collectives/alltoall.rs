use super::{closing_barrier, member};
use crate::shmem_arch::ActiveSet;
use crate::shmem_rt::ShmemRT;
use crate::symmetric::{SymAddr, SymmetricPtr};

#[allow(clippy::too_many_arguments)]
fn exchange(
    rt: &ShmemRT,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    set: &ActiveSet,
    me: usize,
    psync: SymmetricPtr<i64>,
    order: impl Iterator<Item = usize>,
) {
    if nbytes > 0 {
        for j in order {
            let block = rt.get_vec(rt.my_pe, src.byte_add(j * nbytes), nbytes);
            rt.put_bytes(member(set, j), dest.byte_add(me * nbytes), &block);
        }
    }
    rt.quiet();
    closing_barrier(rt, set, me, psync);
}

/// Block `j` of every source goes to slot `me` of member `j`, peers visited in set order.
pub(crate) fn direct(
    rt: &ShmemRT,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    set: &ActiveSet,
    me: usize,
    psync: SymmetricPtr<i64>,
) {
    exchange(rt, dest, src, nbytes, set, me, psync, 0..set.size());
}

/// Same exchange as [direct], but member `me` starts with peer `me + 1` so the first puts of all
/// members target different pes.
pub(crate) fn shifted(
    rt: &ShmemRT,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    set: &ActiveSet,
    me: usize,
    psync: SymmetricPtr<i64>,
) {
    let k = set.size();
    exchange(rt, dest, src, nbytes, set, me, psync, (1..=k).map(|s| (me + s) % k));
}

/// Strided alltoall: element `k` of block `j` is read at `(j * nelems + k) * sst` of the source and
/// lands at `(me * nelems + k) * dst` of member `j`'s target (strides and indices in elements).
#[allow(clippy::too_many_arguments)]
pub(crate) fn strided(
    rt: &ShmemRT,
    dest: SymAddr,
    src: SymAddr,
    elem_size: usize,
    dst: usize,
    sst: usize,
    nelems: usize,
    set: &ActiveSet,
    me: usize,
    psync: SymmetricPtr<i64>,
) {
    let k = set.size();
    for j in (1..=k).map(|s| (me + s) % k) {
        let pe = member(set, j);
        for e in 0..nelems {
            let from = src.byte_add((j * nelems + e) * sst * elem_size);
            let to = dest.byte_add((me * nelems + e) * dst * elem_size);
            let val = rt.get_vec(rt.my_pe, from, elem_size);
            rt.put_bytes(pe, to, &val);
        }
    }
    rt.quiet();
    closing_barrier(rt, set, me, psync);
}
