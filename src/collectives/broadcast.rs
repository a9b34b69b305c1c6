use super::{closing_barrier, member, SYNC_VALUE};
use crate::progress::Comparator;
use crate::shmem_arch::ActiveSet;
use crate::shmem_rt::ShmemRT;
use crate::symmetric::{SymAddr, SymmetricPtr};

use tracing::trace;

/// The root puts the data into every other member's target, then everybody meets in a barrier.
#[allow(clippy::too_many_arguments)]
pub(crate) fn linear(
    rt: &ShmemRT,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    root: usize,
    set: &ActiveSet,
    me: usize,
    psync: SymmetricPtr<i64>,
) {
    if me == root && nbytes > 0 {
        let data = rt.get_vec(rt.my_pe, src, nbytes);
        for i in (0..set.size()).filter(|i| *i != root) {
            rt.put_bytes(member(set, i), dest, &data);
        }
        rt.quiet();
    }
    closing_barrier(rt, set, me, psync.offset(1));
}

/// position of set member `index` in a binary tree rooted at position 0, with `root` moved there
fn tree_position(index: usize, root: usize) -> usize {
    if index == root {
        0
    } else if index == 0 {
        root
    } else {
        index
    }
}

/// Binary tree broadcast.
///
/// Positions are set indices with `root` and 0 swapped; position `p` feeds `2p+1` and `2p+2`. A parent
/// first puts the data into its children's targets and then raises their arrival cell (`psync[0]`);
/// a child waits on that cell, resets it and forwards its target. The root's target is never written.
#[allow(clippy::too_many_arguments)]
pub(crate) fn tree(
    rt: &ShmemRT,
    dest: SymAddr,
    src: SymAddr,
    nbytes: usize,
    root: usize,
    set: &ActiveSet,
    me: usize,
    psync: SymmetricPtr<i64>,
) {
    let arrival = psync.elem(0);
    let k = set.size();
    let pos = tree_position(me, root);
    let data = if pos == 0 {
        rt.get_vec(rt.my_pe, src, nbytes)
    } else {
        rt.wait_i64(arrival, Comparator::Ne, SYNC_VALUE);
        rt.put_i64(rt.my_pe, arrival, SYNC_VALUE);
        rt.get_vec(rt.my_pe, dest, nbytes)
    };
    for child in [2 * pos + 1, 2 * pos + 2].into_iter().filter(|c| *c < k) {
        // a child's position is its own index except for the swapped pair
        let pe = member(set, tree_position(child, root));
        if nbytes > 0 {
            rt.put_bytes(pe, dest, &data);
        }
        rt.quiet();
        rt.put_i64(pe, arrival, SYNC_VALUE + 1);
        trace!("pe {} forwarded {} bytes to pe {}", rt.my_pe, nbytes, pe);
    }
    closing_barrier(rt, set, me, psync.offset(1));
}
