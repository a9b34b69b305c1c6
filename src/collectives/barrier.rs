use super::{member, SYNC_VALUE};
use crate::atomic::AtomicOp;
use crate::lamellae::LamellaeComm;
use crate::progress::Comparator;
use crate::shmem_arch::ActiveSet;
use crate::shmem_rt::ShmemRT;
use crate::symmetric::SymmetricPtr;

use tracing::trace;

/// Root/follower barrier on `psync[0]`.
///
/// Followers increment the root's cell and wait for the root to overwrite their own; the root waits
/// until all `K-1` increments have arrived, resets its cell and then releases every follower.
pub(crate) fn linear(rt: &ShmemRT, set: &ActiveSet, me: usize, psync: SymmetricPtr<i64>) {
    let cell = psync.elem(0);
    let root = member(set, 0);
    if me == 0 {
        let arrived = SYNC_VALUE + set.size() as i64 - 1;
        rt.wait_i64(cell, Comparator::Eq, arrived);
        rt.put_i64(rt.my_pe, cell, SYNC_VALUE);
        for i in 1..set.size() {
            rt.put_i64(member(set, i), cell, SYNC_VALUE + 1);
        }
    } else {
        rt.atomic_post_op(root, cell, AtomicOp::Inc, 8, 0);
        rt.wait_i64(cell, Comparator::Ne, SYNC_VALUE);
        rt.put_i64(rt.my_pe, cell, SYNC_VALUE);
    }
    trace!("pe {} left linear barrier of {:?}", rt.my_pe, set);
}

/// Dissemination barrier: in round `r` signal the member `2^r` positions ahead on `psync[r]` and
/// wait for the signal from the member `2^r` positions behind.
///
/// Signals are consumed by decrementing rather than overwriting, so an early signal belonging to
/// the next barrier is never lost.
pub(crate) fn dissemination(rt: &ShmemRT, set: &ActiveSet, me: usize, psync: SymmetricPtr<i64>) {
    let k = set.size();
    let mut dist = 1;
    let mut round = 0;
    while dist < k {
        let cell = psync.elem(round);
        let partner = member(set, (me + dist) % k);
        rt.atomic_post_op(partner, cell, AtomicOp::Add, 8, 1);
        rt.wait_i64(cell, Comparator::Ne, SYNC_VALUE);
        rt.atomic_fetch_op(rt.my_pe, cell, AtomicOp::Fadd, 8, (-1i64) as u64 as u128, 0);
        dist <<= 1;
        round += 1;
    }
    trace!("pe {} left dissemination barrier of {:?} after {} rounds", rt.my_pe, set, round);
}

/// The transport's own barrier, which only spans the whole job; other sets use [linear].
pub(crate) fn transport(rt: &ShmemRT, set: &ActiveSet, me: usize, psync: SymmetricPtr<i64>) {
    if set.is_world(rt.num_pes) {
        if let Err(e) = rt.lamellae.barrier() {
            rt.fatal(e);
        }
    } else {
        linear(rt, set, me, psync)
    }
}
