//! Collective operations over an [ActiveSet].
//!
//! Every collective is built from one-sided put/get and remote atomics on symmetric memory. Each call
//! takes a caller owned pSync array (symmetric `i64`s, all equal to [SYNC_VALUE] at rest) that the
//! algorithm uses for its internal signalling and restores before returning, so the same pSync can be
//! reused by the next call of the same kind.
//!
//! The algorithm used for each collective kind is chosen once at init, see [registry].
use crate::error::ShmemError;
use crate::shmem_arch::ActiveSet;
use crate::shmem_rt::ShmemRT;
use crate::symmetric::SymmetricPtr;

pub(crate) mod alltoall;
pub(crate) mod barrier;
pub(crate) mod broadcast;
pub(crate) mod collect;
pub(crate) mod reduce;
pub(crate) mod registry;

/// Value every pSync element holds at rest.
pub const SYNC_VALUE: i64 = -1;
/// Number of pSync elements required by `barrier`.
pub const BARRIER_SYNC_SIZE: usize = 64;
/// Number of pSync elements required by `broadcast`.
pub const BCAST_SYNC_SIZE: usize = 1 + BARRIER_SYNC_SIZE;
/// Number of pSync elements required by `collect` and `fcollect`.
pub const COLLECT_SYNC_SIZE: usize = 1 + BARRIER_SYNC_SIZE;
/// Number of pSync elements required by `alltoall` and `alltoalls`.
pub const ALLTOALL_SYNC_SIZE: usize = BARRIER_SYNC_SIZE;
/// Number of pSync elements required by the `*_to_all` reductions.
pub const REDUCE_SYNC_SIZE: usize = BARRIER_SYNC_SIZE;

/// Checks shared by every collective entry point; returns the calling pe's index in `set`.
pub(crate) fn prepare(
    rt: &ShmemRT,
    set: &ActiveSet,
    psync: SymmetricPtr<i64>,
    needed: usize,
) -> usize {
    rt.check_live();
    let me = match set.validate(rt.my_pe, rt.num_pes) {
        Ok(me) => me,
        Err(e) => rt.fatal(e),
    };
    if psync.len() < needed {
        rt.fatal(ShmemError::SyncArrayTooSmall {
            needed,
            len: psync.len(),
        });
    }
    me
}

/// world id of the `index`-th member of an already validated set
pub(crate) fn member(set: &ActiveSet, index: usize) -> usize {
    set.start_pe() + (index << set.log_stride())
}

/// the configured barrier over `set`, without the leading quiet
pub(crate) fn closing_barrier(rt: &ShmemRT, set: &ActiveSet, me: usize, psync: SymmetricPtr<i64>) {
    (rt.algorithms.barrier.1)(rt, set, me, psync)
}
