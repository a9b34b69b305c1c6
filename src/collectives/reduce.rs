use super::closing_barrier;
use crate::shmem_arch::ActiveSet;
use crate::shmem_rt::ShmemRT;
use crate::symmetric::SymmetricPtr;
use crate::utils::{as_bytes, from_bytes};

/// Elementwise reduction of `nreduce` elements of `src` over `set`, written to the local `dest`.
///
/// Every member reads every source (in set order, so all members fold in the same order and agree
/// bit for bit on floating point results) between two barriers; only then is the local target
/// written, which makes `dest == src` safe.
#[allow(clippy::too_many_arguments)]
pub(crate) fn to_all<T: Copy>(
    rt: &ShmemRT,
    dest: SymmetricPtr<T>,
    src: SymmetricPtr<T>,
    nreduce: usize,
    set: &ActiveSet,
    me: usize,
    psync: SymmetricPtr<i64>,
    op: impl Fn(T, T) -> T,
) {
    let nbytes = nreduce * std::mem::size_of::<T>();
    closing_barrier(rt, set, me, psync);
    let mut acc: Option<Vec<T>> = None;
    for pe in set.iter() {
        let bytes = rt.get_vec(pe, src.addr(), nbytes);
        // every bit pattern came from a T
        let vals: Vec<T> = unsafe { from_bytes(&bytes) };
        acc = Some(match acc {
            None => vals,
            Some(acc) => acc.into_iter().zip(vals).map(|(a, b)| op(a, b)).collect(),
        });
    }
    closing_barrier(rt, set, me, psync);
    if let Some(acc) = acc {
        if nbytes > 0 {
            rt.put_bytes(rt.my_pe, dest.addr(), as_bytes(&acc));
        }
    }
}
