//! The operation surface of a [ShmemWorld].
//!
//! Every method here is a thin adapter: it validates its arguments, reports entry and exit to the
//! installed [ShmemInterceptor] (if any), converts typed data to bytes or bit patterns and forwards
//! to the width generic core in the runtime.
use crate::atomic::{AtomicArith, AtomicOp, AtomicValue};
use crate::collectives::{
    self, alltoall, reduce, ALLTOALL_SYNC_SIZE, BARRIER_SYNC_SIZE, BCAST_SYNC_SIZE,
    COLLECT_SYNC_SIZE, REDUCE_SYNC_SIZE, SYNC_VALUE,
};
use crate::error::{MallocResult, MallocStatus, ShmemError};
use crate::handles::RdmaHandle;
use crate::lock::ShmemLock;
use crate::progress::Comparator;
use crate::shmem_arch::ActiveSet;
use crate::shmem_world::ShmemWorld;
use crate::symmetric::heap::DEFAULT_ALIGN;
use crate::symmetric::{SymAddr, SymmetricPtr};
use crate::utils::{as_bytes, as_bytes_mut, from_bytes};

use std::ops::{Add, BitAnd, BitOr, BitXor, Mul};

/// A profiling hook installed with
/// [ShmemWorldBuilder::with_interceptor][crate::ShmemWorldBuilder::with_interceptor].
///
/// `enter` and `exit` bracket every operation called on a [ShmemWorld]; `op` is the method name.
/// Operations issued by the runtime on its own behalf (e.g. the barrier inside `malloc`) are not
/// reported separately.
pub trait ShmemInterceptor: Send + Sync {
    fn enter(&self, _pe: usize, _op: &'static str) {}
    fn exit(&self, _pe: usize, _op: &'static str) {}
}

struct CallGuard<'a> {
    interceptor: Option<&'a dyn ShmemInterceptor>,
    pe: usize,
    op: &'static str,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(interceptor) = self.interceptor {
            interceptor.exit(self.pe, self.op);
        }
    }
}

/// Plain data that can be moved between PEs byte for byte.
pub trait Remote: Copy + Send + Sync + 'static {}

macro_rules! impl_remote {
    ($($t:ty),*) => {
        $(impl Remote for $t {})*
    };
}

impl_remote!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl ShmemWorld {
    fn intercept(&self, op: &'static str) -> CallGuard<'_> {
        let interceptor = self.interceptor.as_deref();
        if let Some(interceptor) = interceptor {
            interceptor.enter(self.rt.my_pe, op);
        }
        CallGuard {
            interceptor,
            pe: self.rt.my_pe,
            op,
        }
    }

    /// `n` elements starting at `ptr` must lie inside the object
    fn check_fits<T>(&self, ptr: SymmetricPtr<T>, n: usize, pe: usize) {
        if n > ptr.len() {
            self.rt.fatal(ShmemError::OutOfSegment {
                pe,
                addr: ptr.addr(),
                len: n * std::mem::size_of::<T>(),
            });
        }
    }

    /// the strided range `0, stride, .., (n-1)*stride` must lie inside an object of `len` elements
    fn check_strided(&self, addr: SymAddr, len: usize, stride: usize, n: usize, pe: usize) {
        if n > 0 && (n - 1).saturating_mul(stride) >= len {
            self.rt.fatal(ShmemError::OutOfSegment { pe, addr, len: n });
        }
    }

    fn check_atomic_target<T: AtomicValue>(&self, ptr: SymmetricPtr<T>) {
        if ptr.addr().offset % T::WIDTH.min(8) != 0 {
            self.rt.fatal(ShmemError::Misaligned {
                addr: ptr.addr(),
                width: T::WIDTH,
            });
        }
    }

    //#################################################################
    // one-sided put/get
    //#################################################################

    /// Copy `src` into the first `src.len()` elements of `dest` on `pe`.
    ///
    /// Returns once `src` may be reused; use [quiet][Self::quiet] to wait for remote completion.
    pub fn put<T: Remote>(&self, dest: SymmetricPtr<T>, src: &[T], pe: usize) {
        let _call = self.intercept("put");
        self.check_fits(dest, src.len(), pe);
        if !src.is_empty() {
            self.rt.put_bytes(pe, dest.addr(), as_bytes(src));
        }
    }

    /// Copy the first `dest.len()` elements of `src` on `pe` into `dest`.
    pub fn get<T: Remote>(&self, dest: &mut [T], src: SymmetricPtr<T>, pe: usize) {
        let _call = self.intercept("get");
        self.check_fits(src, dest.len(), pe);
        if !dest.is_empty() {
            // the bytes come from a T on the other pe
            self.rt
                .get_bytes(pe, src.addr(), unsafe { as_bytes_mut(dest) });
        }
    }

    /// single element put
    pub fn p<T: Remote>(&self, dest: SymmetricPtr<T>, value: T, pe: usize) {
        let _call = self.intercept("p");
        self.check_fits(dest, 1, pe);
        self.rt.put_bytes(pe, dest.addr(), as_bytes(&[value]));
    }

    /// single element get
    pub fn g<T: Remote>(&self, src: SymmetricPtr<T>, pe: usize) -> T {
        let _call = self.intercept("g");
        self.check_fits(src, 1, pe);
        let bytes = self.rt.get_vec(pe, src.addr(), std::mem::size_of::<T>());
        // the bytes came from a T on the other pe
        unsafe { from_bytes::<T>(&bytes)[0] }
    }

    /// Strided put: element `i * sst` of `src` goes to element `i * dst` of `dest` on `pe`, for `i < nelems`.
    pub fn iput<T: Remote>(
        &self,
        dest: SymmetricPtr<T>,
        src: &[T],
        dst: usize,
        sst: usize,
        nelems: usize,
        pe: usize,
    ) {
        let _call = self.intercept("iput");
        self.check_strided(dest.addr(), dest.len(), dst, nelems, pe);
        if nelems > 0 && (nelems - 1) * sst >= src.len() {
            self.rt.fatal(ShmemError::OutOfSegment {
                pe: self.rt.my_pe,
                addr: dest.addr(),
                len: nelems,
            });
        }
        for i in 0..nelems {
            self.rt
                .put_bytes(pe, dest.elem(i * dst), as_bytes(&src[i * sst..i * sst + 1]));
        }
    }

    /// Strided get: element `i * sst` of `src` on `pe` goes to element `i * dst` of `dest`.
    pub fn iget<T: Remote>(
        &self,
        dest: &mut [T],
        src: SymmetricPtr<T>,
        dst: usize,
        sst: usize,
        nelems: usize,
        pe: usize,
    ) {
        let _call = self.intercept("iget");
        self.check_strided(src.addr(), src.len(), sst, nelems, pe);
        if nelems > 0 && (nelems - 1) * dst >= dest.len() {
            self.rt.fatal(ShmemError::OutOfSegment {
                pe: self.rt.my_pe,
                addr: src.addr(),
                len: nelems,
            });
        }
        for i in 0..nelems {
            let slot = &mut dest[i * dst..i * dst + 1];
            self.rt
                .get_bytes(pe, src.elem(i * sst), unsafe { as_bytes_mut(slot) });
        }
    }

    /// byte granular [put][Self::put]
    pub fn putmem(&self, dest: SymmetricPtr<u8>, src: &[u8], pe: usize) {
        self.put(dest, src, pe)
    }

    /// byte granular [get][Self::get]
    pub fn getmem(&self, dest: &mut [u8], src: SymmetricPtr<u8>, pe: usize) {
        self.get(dest, src, pe)
    }

    /// Start a put and return a handle to wait on; `src` is copied before the call returns.
    pub fn put_nb<T: Remote>(&self, dest: SymmetricPtr<T>, src: &[T], pe: usize) -> RdmaHandle {
        let _call = self.intercept("put_nb");
        self.check_fits(dest, src.len(), pe);
        let handle = RdmaHandle::new(self.rt.clone());
        self.rt
            .put_nb_bytes(pe, dest.addr(), as_bytes(src).to_vec(), Some(handle.flag()));
        handle
    }

    /// Start a get of `nelems` elements of `src` on `pe` into the calling PE's copy of `dest`.
    pub fn get_nb<T: Remote>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nelems: usize,
        pe: usize,
    ) -> RdmaHandle {
        let _call = self.intercept("get_nb");
        self.check_fits(src, nelems, pe);
        self.check_fits(dest, nelems, self.rt.my_pe);
        let handle = RdmaHandle::new(self.rt.clone());
        self.rt.get_nb_bytes(
            pe,
            src.addr(),
            nelems * std::mem::size_of::<T>(),
            dest.addr(),
            Some(handle.flag()),
        );
        handle
    }

    /// [put_nb][Self::put_nb] without a handle, completed by [quiet][Self::quiet]
    pub fn put_nbi<T: Remote>(&self, dest: SymmetricPtr<T>, src: &[T], pe: usize) {
        let _call = self.intercept("put_nbi");
        self.check_fits(dest, src.len(), pe);
        self.rt
            .put_nb_bytes(pe, dest.addr(), as_bytes(src).to_vec(), None);
    }

    /// [get_nb][Self::get_nb] without a handle, completed by [quiet][Self::quiet]
    pub fn get_nbi<T: Remote>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nelems: usize,
        pe: usize,
    ) {
        let _call = self.intercept("get_nbi");
        self.check_fits(src, nelems, pe);
        self.check_fits(dest, nelems, self.rt.my_pe);
        self.rt.get_nb_bytes(
            pe,
            src.addr(),
            nelems * std::mem::size_of::<T>(),
            dest.addr(),
            None,
        );
    }

    //#################################################################
    // atomics
    //#################################################################

    fn fetch_op<T: AtomicValue>(
        &self,
        target: SymmetricPtr<T>,
        op: AtomicOp,
        value: T,
        cond: T,
        pe: usize,
    ) -> T {
        self.check_fits(target, 1, pe);
        T::from_bits(
            self.rt
                .atomic_fetch_op(pe, target.addr(), op, T::WIDTH, value.to_bits(), cond.to_bits()),
        )
    }

    fn post_op<T: AtomicValue>(&self, target: SymmetricPtr<T>, op: AtomicOp, value: T, pe: usize) {
        self.check_fits(target, 1, pe);
        self.rt
            .atomic_post_op(pe, target.addr(), op, T::WIDTH, value.to_bits());
    }

    /// Atomically replace `target` on `pe` with `value`, returning the previous value.
    pub fn swap<T: AtomicValue>(&self, target: SymmetricPtr<T>, value: T, pe: usize) -> T {
        let _call = self.intercept("swap");
        self.fetch_op(target, AtomicOp::Swap, value, value, pe)
    }

    /// Atomically store `value` into `target` on `pe` if it currently equals `cond`.
    ///
    /// Always returns the value `target` held before the call.
    pub fn cswap<T: AtomicArith>(
        &self,
        target: SymmetricPtr<T>,
        cond: T,
        value: T,
        pe: usize,
    ) -> T {
        let _call = self.intercept("cswap");
        self.fetch_op(target, AtomicOp::Cswap, value, cond, pe)
    }

    /// Atomically add `value` to `target` on `pe`, returning the previous value.
    pub fn fadd<T: AtomicArith>(&self, target: SymmetricPtr<T>, value: T, pe: usize) -> T {
        let _call = self.intercept("fadd");
        self.fetch_op(target, AtomicOp::Fadd, value, value, pe)
    }

    /// Atomically increment `target` on `pe`, returning the previous value.
    pub fn finc<T: AtomicArith>(&self, target: SymmetricPtr<T>, pe: usize) -> T {
        let _call = self.intercept("finc");
        self.fetch_op(target, AtomicOp::Finc, T::from_bits(0), T::from_bits(0), pe)
    }

    /// Atomically add `value` to `target` on `pe` without waiting for the result.
    pub fn add<T: AtomicArith>(&self, target: SymmetricPtr<T>, value: T, pe: usize) {
        let _call = self.intercept("add");
        self.post_op(target, AtomicOp::Add, value, pe)
    }

    /// Atomically increment `target` on `pe` without waiting for the result.
    pub fn inc<T: AtomicArith>(&self, target: SymmetricPtr<T>, pe: usize) {
        let _call = self.intercept("inc");
        self.post_op(target, AtomicOp::Inc, T::from_bits(0), pe)
    }

    /// atomic read
    pub fn fetch<T: AtomicValue>(&self, target: SymmetricPtr<T>, pe: usize) -> T {
        let _call = self.intercept("fetch");
        self.fetch_op(target, AtomicOp::Fetch, T::from_bits(0), T::from_bits(0), pe)
    }

    /// atomic write, completed by [quiet][Self::quiet]
    pub fn set<T: AtomicValue>(&self, target: SymmetricPtr<T>, value: T, pe: usize) {
        let _call = self.intercept("set");
        self.post_op(target, AtomicOp::Set, value, pe)
    }

    //#################################################################
    // point to point synchronization
    //#################################################################

    /// Block until the calling PE's `ivar` differs from `value`; returns the new value.
    pub fn wait<T: AtomicValue + PartialOrd>(&self, ivar: SymmetricPtr<T>, value: T) -> T {
        self.wait_until(ivar, Comparator::Ne, value)
    }

    /// Block until `ivar <cmp> value` holds for the calling PE's `ivar`; returns the value that satisfied it.
    ///
    /// # Examples
    ///
    ///```
    /// use rshmem::{Comparator, ShmemWorldBuilder};
    ///
    /// let world = ShmemWorldBuilder::new().with_heap_size(1 << 16).build();
    /// let flag = world.malloc::<i64>(1).unwrap();
    /// world.p(flag, 3, 0);
    /// assert_eq!(world.wait_until(flag, Comparator::Ge, 2), 3);
    ///```
    pub fn wait_until<T: AtomicValue + PartialOrd>(
        &self,
        ivar: SymmetricPtr<T>,
        cmp: Comparator,
        value: T,
    ) -> T {
        let _call = self.intercept("wait_until");
        self.rt.check_live();
        self.check_fits(ivar, 1, self.rt.my_pe);
        self.check_atomic_target(ivar);
        T::from_bits(self.rt.wait_word(ivar.addr(), T::WIDTH, "wait_until", |bits| {
            cmp.compare(T::from_bits(bits), value)
        }))
    }

    /// Barrier over the members of `set`, using `psync` (at least [BARRIER_SYNC_SIZE] elements).
    ///
    /// Outstanding puts and atomics of the calling PE are completed first.
    #[tracing::instrument(skip_all)]
    pub fn barrier(&self, set: ActiveSet, psync: SymmetricPtr<i64>) {
        let _call = self.intercept("barrier");
        let me = collectives::prepare(&self.rt, &set, psync, BARRIER_SYNC_SIZE);
        self.rt.quiet();
        collectives::closing_barrier(&self.rt, &set, me, psync);
    }

    /// Barrier over every PE, completing outstanding puts and atomics first.
    #[tracing::instrument(skip_all)]
    pub fn barrier_all(&self) {
        let _call = self.intercept("barrier_all");
        self.rt.check_live();
        self.rt.barrier_all();
    }

    /// Order earlier puts and atomics before later ones.
    pub fn fence(&self) {
        let _call = self.intercept("fence");
        self.rt.check_live();
        self.rt.quiet();
    }

    /// Wait until every put, nonblocking transfer and atomic issued by the calling PE has completed.
    pub fn quiet(&self) {
        let _call = self.intercept("quiet");
        self.rt.check_live();
        self.rt.quiet();
    }

    //#################################################################
    // collectives
    //#################################################################

    /// Copy `nelems` elements of `src` on the `root`-th member of `set` into `dest` on every other member.
    ///
    /// `root` is an index into the active set, not a PE id. The root's own `dest` is left untouched.
    /// `psync` needs [BCAST_SYNC_SIZE] elements.
    #[tracing::instrument(skip_all)]
    pub fn broadcast<T: Remote>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nelems: usize,
        root: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        let _call = self.intercept("broadcast");
        let me = collectives::prepare(&self.rt, &set, psync, BCAST_SYNC_SIZE);
        if root >= set.size() {
            self.rt.fatal(ShmemError::PeOutOfRange {
                pe: root,
                num_pes: set.size(),
            });
        }
        self.check_fits(dest, nelems, self.rt.my_pe);
        self.check_fits(src, nelems, self.rt.my_pe);
        (self.rt.algorithms.broadcast.1)(
            &self.rt,
            dest.addr(),
            src.addr(),
            nelems * std::mem::size_of::<T>(),
            root,
            &set,
            me,
            psync,
        );
    }

    /// Concatenate the `nelems` elements contributed by each member (which may differ between
    /// members) into `dest` on every member, in set order. `psync` needs [COLLECT_SYNC_SIZE] elements.
    #[tracing::instrument(skip_all)]
    pub fn collect<T: Remote>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nelems: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        let _call = self.intercept("collect");
        let me = collectives::prepare(&self.rt, &set, psync, COLLECT_SYNC_SIZE);
        self.check_fits(src, nelems, self.rt.my_pe);
        (self.rt.algorithms.collect.1)(
            &self.rt,
            dest.addr(),
            src.addr(),
            nelems * std::mem::size_of::<T>(),
            &set,
            me,
            psync,
        );
    }

    /// [collect][Self::collect] where every member contributes the same `nelems`.
    #[tracing::instrument(skip_all)]
    pub fn fcollect<T: Remote>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nelems: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        let _call = self.intercept("fcollect");
        let me = collectives::prepare(&self.rt, &set, psync, COLLECT_SYNC_SIZE);
        self.check_fits(src, nelems, self.rt.my_pe);
        self.check_fits(dest, nelems * set.size(), self.rt.my_pe);
        (self.rt.algorithms.fcollect.1)(
            &self.rt,
            dest.addr(),
            src.addr(),
            nelems * std::mem::size_of::<T>(),
            &set,
            me,
            psync,
        );
    }

    /// Block `j` (of `nelems` elements) of `src` goes to block `me` of `dest` on the `j`-th member.
    /// `psync` needs [ALLTOALL_SYNC_SIZE] elements.
    #[tracing::instrument(skip_all)]
    pub fn alltoall<T: Remote>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nelems: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        let _call = self.intercept("alltoall");
        let me = collectives::prepare(&self.rt, &set, psync, ALLTOALL_SYNC_SIZE);
        self.check_fits(src, nelems * set.size(), self.rt.my_pe);
        self.check_fits(dest, nelems * set.size(), self.rt.my_pe);
        (self.rt.algorithms.alltoall.1)(
            &self.rt,
            dest.addr(),
            src.addr(),
            nelems * std::mem::size_of::<T>(),
            &set,
            me,
            psync,
        );
    }

    /// Strided [alltoall][Self::alltoall]: element `k` of the block for member `j` is read at
    /// `(j * nelems + k) * sst` and written at `(me * nelems + k) * dst` of member `j`'s `dest`.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip_all)]
    pub fn alltoalls<T: Remote>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        dst: usize,
        sst: usize,
        nelems: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        let _call = self.intercept("alltoalls");
        let me = collectives::prepare(&self.rt, &set, psync, ALLTOALL_SYNC_SIZE);
        let total = nelems * set.size();
        self.check_strided(src.addr(), src.len(), sst, total, self.rt.my_pe);
        self.check_strided(dest.addr(), dest.len(), dst, total, self.rt.my_pe);
        alltoall::strided(
            &self.rt,
            dest.addr(),
            src.addr(),
            std::mem::size_of::<T>(),
            dst,
            sst,
            nelems,
            &set,
            me,
            psync,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn reduce_with<T: Remote>(
        &self,
        op: &'static str,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nreduce: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
        f: impl Fn(T, T) -> T,
    ) {
        let _call = self.intercept(op);
        let me = collectives::prepare(&self.rt, &set, psync, REDUCE_SYNC_SIZE);
        self.check_fits(src, nreduce, self.rt.my_pe);
        self.check_fits(dest, nreduce, self.rt.my_pe);
        reduce::to_all(&self.rt, dest, src, nreduce, &set, me, psync, f);
    }

    /// Elementwise sum of `src` over `set`, stored in `dest` on every member; `psync` needs
    /// [REDUCE_SYNC_SIZE] elements. `dest` may equal `src`.
    #[tracing::instrument(skip_all)]
    pub fn sum_to_all<T: Remote + Add<Output = T>>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nreduce: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        self.reduce_with("sum_to_all", dest, src, nreduce, set, psync, |a, b| a + b)
    }

    #[tracing::instrument(skip_all)]
    pub fn prod_to_all<T: Remote + Mul<Output = T>>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nreduce: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        self.reduce_with("prod_to_all", dest, src, nreduce, set, psync, |a, b| a * b)
    }

    #[tracing::instrument(skip_all)]
    pub fn min_to_all<T: Remote + PartialOrd>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nreduce: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        self.reduce_with("min_to_all", dest, src, nreduce, set, psync, |a, b| {
            if b < a {
                b
            } else {
                a
            }
        })
    }

    #[tracing::instrument(skip_all)]
    pub fn max_to_all<T: Remote + PartialOrd>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nreduce: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        self.reduce_with("max_to_all", dest, src, nreduce, set, psync, |a, b| {
            if b > a {
                b
            } else {
                a
            }
        })
    }

    #[tracing::instrument(skip_all)]
    pub fn and_to_all<T: Remote + BitAnd<Output = T>>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nreduce: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        self.reduce_with("and_to_all", dest, src, nreduce, set, psync, |a, b| a & b)
    }

    #[tracing::instrument(skip_all)]
    pub fn or_to_all<T: Remote + BitOr<Output = T>>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nreduce: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        self.reduce_with("or_to_all", dest, src, nreduce, set, psync, |a, b| a | b)
    }

    #[tracing::instrument(skip_all)]
    pub fn xor_to_all<T: Remote + BitXor<Output = T>>(
        &self,
        dest: SymmetricPtr<T>,
        src: SymmetricPtr<T>,
        nreduce: usize,
        set: ActiveSet,
        psync: SymmetricPtr<i64>,
    ) {
        self.reduce_with("xor_to_all", dest, src, nreduce, set, psync, |a, b| a ^ b)
    }

    //#################################################################
    // locks
    //#################################################################

    /// Collectively allocate and initialize a lock.
    #[tracing::instrument(skip_all)]
    pub fn new_lock(&self) -> MallocResult<ShmemLock> {
        let _call = self.intercept("new_lock");
        let addr = self.rt.memalign_bytes(ShmemLock::SIZE, ShmemLock::SIZE)?;
        let lock = ShmemLock::from_ptr(SymmetricPtr::from_addr(addr, 2));
        self.rt.lock_init(&lock);
        self.rt.barrier_all();
        Ok(lock)
    }

    /// Collectively release a lock created by [new_lock][Self::new_lock]; it must not be held.
    #[tracing::instrument(skip_all)]
    pub fn free_lock(&self, lock: ShmemLock) -> MallocResult<()> {
        let _call = self.intercept("free_lock");
        self.rt.free_bytes(lock.ptr().addr())
    }

    /// Declare a lock in the static segment (not collective, every PE must declare it in the same order).
    ///
    /// The lock starts out all zero. That state is accepted as free only while lock word normalization
    /// is enabled (the default); otherwise the calling PE's copy is initialized here and a barrier is
    /// needed before any PE uses the lock.
    pub fn declare_static_lock(&self) -> MallocResult<ShmemLock> {
        let _call = self.intercept("declare_static_lock");
        let addr = self.rt.declare_static_bytes(ShmemLock::SIZE, ShmemLock::SIZE)?;
        let lock = ShmemLock::from_ptr(SymmetricPtr::from_addr(addr, 2));
        if !self.rt.config.lock_legacy_zero {
            self.rt.lock_init(&lock);
        }
        Ok(lock)
    }

    /// Block until the calling PE holds `lock`.
    pub fn set_lock(&self, lock: &ShmemLock) {
        let _call = self.intercept("set_lock");
        self.rt.set_lock(lock)
    }

    /// Release `lock`, handing it to the next queued PE if there is one.
    pub fn clear_lock(&self, lock: &ShmemLock) {
        let _call = self.intercept("clear_lock");
        self.rt.clear_lock(lock)
    }

    /// Acquire `lock` if it is free; returns true if the calling PE now holds it.
    pub fn test_lock(&self, lock: &ShmemLock) -> bool {
        let _call = self.intercept("test_lock");
        self.rt.test_lock(lock)
    }

    //#################################################################
    // symmetric memory
    //#################################################################

    fn byte_len<T>(len: usize) -> usize {
        // an overflowing request is reported as a bad size
        len.checked_mul(std::mem::size_of::<T>()).unwrap_or(0)
    }

    /// Collectively allocate `len` elements of symmetric heap.
    ///
    /// Every PE must pass the same `len`. The block is 16 byte aligned and not zeroed.
    ///
    /// # Examples
    ///
    ///```
    /// use rshmem::ShmemWorldBuilder;
    ///
    /// let world = ShmemWorldBuilder::new().with_heap_size(1 << 16).build();
    /// let data = world.malloc::<u64>(8).unwrap();
    /// world.put(data, &[7; 8], world.my_pe());
    /// assert_eq!(world.g(data.sub(3, 1), world.my_pe()), 7);
    /// world.free(data).unwrap();
    ///```
    #[tracing::instrument(skip_all)]
    pub fn malloc<T: Remote>(&self, len: usize) -> MallocResult<SymmetricPtr<T>> {
        let _call = self.intercept("malloc");
        let addr = self.rt.malloc_bytes(Self::byte_len::<T>(len))?;
        Ok(SymmetricPtr::from_addr(addr, len))
    }

    /// Collectively allocate `len` elements aligned to `align` bytes (a power of two).
    #[tracing::instrument(skip_all)]
    pub fn memalign<T: Remote>(&self, align: usize, len: usize) -> MallocResult<SymmetricPtr<T>> {
        let _call = self.intercept("memalign");
        let addr = self.rt.memalign_bytes(align, Self::byte_len::<T>(len))?;
        Ok(SymmetricPtr::from_addr(addr, len))
    }

    /// Collectively move `ptr` to a block of `len` elements, keeping the common prefix.
    #[tracing::instrument(skip_all)]
    pub fn realloc<T: Remote>(
        &self,
        ptr: SymmetricPtr<T>,
        len: usize,
    ) -> MallocResult<SymmetricPtr<T>> {
        let _call = self.intercept("realloc");
        let addr = self.rt.realloc_bytes(ptr.addr(), Self::byte_len::<T>(len))?;
        Ok(SymmetricPtr::from_addr(addr, len))
    }

    /// Collectively release a block returned by [malloc][Self::malloc], [memalign][Self::memalign]
    /// or [realloc][Self::realloc].
    #[tracing::instrument(skip_all)]
    pub fn free<T>(&self, ptr: SymmetricPtr<T>) -> MallocResult<()> {
        let _call = self.intercept("free");
        self.rt.free_bytes(ptr.addr())
    }

    /// status of the calling PE's most recent allocator call
    pub fn malloc_error(&self) -> MallocStatus {
        self.rt.malloc_status()
    }

    /// Declare a zero initialized statically symmetric variable of `len` elements.
    ///
    /// Not collective; every PE must declare the same statics in the same order, and a declared
    /// variable lives as long as the world.
    pub fn declare_static<T: Remote>(&self, len: usize) -> MallocResult<SymmetricPtr<T>> {
        let _call = self.intercept("declare_static");
        let addr = self
            .rt
            .declare_static_bytes(Self::byte_len::<T>(len), std::mem::align_of::<T>())?;
        Ok(SymmetricPtr::from_addr(addr, len))
    }

    /// Collectively allocate a pSync array of `len` elements, every element set to [SYNC_VALUE].
    #[tracing::instrument(skip_all)]
    pub fn alloc_psync(&self, len: usize) -> MallocResult<SymmetricPtr<i64>> {
        let _call = self.intercept("alloc_psync");
        let psync = self.rt.memalign_bytes(DEFAULT_ALIGN, Self::byte_len::<i64>(len))?;
        self.rt
            .put_bytes(self.rt.my_pe, psync, as_bytes(&vec![SYNC_VALUE; len]));
        self.rt.barrier_all();
        Ok(SymmetricPtr::from_addr(psync, len))
    }

    /// The calling PE's copy of `ptr`.
    ///
    /// # Safety
    /// Other PEs may write the memory at any time through puts and atomics; the caller must ensure
    /// (e.g. with a barrier) that nobody does while the slice is alive.
    pub unsafe fn local_slice<T: Remote>(&self, ptr: SymmetricPtr<T>) -> &[T] {
        let raw = self.rt.local_ptr(ptr.addr(), ptr.size_in_bytes());
        std::slice::from_raw_parts(raw as *const T, ptr.len())
    }

    /// The calling PE's copy of `ptr`, mutably.
    ///
    /// # Safety
    /// See [local_slice][Self::local_slice]; in addition no other slice of the same memory may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn local_mut_slice<T: Remote>(&self, ptr: SymmetricPtr<T>) -> &mut [T] {
        let raw = self.rt.local_ptr(ptr.addr(), ptr.size_in_bytes());
        std::slice::from_raw_parts_mut(raw as *mut T, ptr.len())
    }

    //#################################################################
    // queries
    //#################################################################

    /// true if `pe` is part of the job and answers a ping before the configured deadline
    pub fn pe_accessible(&self, pe: usize) -> bool {
        let _call = self.intercept("pe_accessible");
        self.rt.pe_accessible(pe)
    }

    /// true if `addr` lies inside a symmetric segment of `pe`
    pub fn addr_accessible(&self, addr: SymAddr, pe: usize) -> bool {
        let _call = self.intercept("addr_accessible");
        if pe >= self.rt.num_pes || self.rt.is_finalized() {
            return false;
        }
        match self.rt.am.segments.read().get(pe, addr.segment) {
            Some(info) => addr.offset < info.size,
            None => false,
        }
    }

    /// Map a raw address of the calling PE's heap to the matching address on `pe`.
    ///
    /// Addresses of statically symmetric variables are returned unchanged.
    pub fn translate(&self, local_addr: usize, pe: usize) -> Result<usize, ShmemError> {
        self.rt.am.segments.read().translate(local_addr, pe)
    }

    /// inverse of [translate][Self::translate]
    pub fn to_local(&self, remote_addr: usize, pe: usize) -> Result<usize, ShmemError> {
        self.rt.am.segments.read().to_local(remote_addr, pe)
    }

    /// raw address of the calling PE's copy of `addr`
    pub fn local_addr(&self, addr: SymAddr) -> usize {
        self.rt.local_ptr(addr, 0) as usize
    }

    /// symmetric address of a raw pointer into one of the calling PE's segments
    pub fn sym_addr(&self, local_addr: usize) -> Option<SymAddr> {
        self.rt.am.segments.read().sym_addr(local_addr)
    }
}

macro_rules! width_rma {
    ($($t:ty: $put:ident, $get:ident, $iput:ident, $iget:ident;)*) => {
        impl ShmemWorld {
            $(
                #[doc = concat!("[put][Self::put] of `", stringify!($t), "` elements")]
                pub fn $put(&self, dest: SymmetricPtr<$t>, src: &[$t], pe: usize) {
                    self.put(dest, src, pe)
                }
                #[doc = concat!("[get][Self::get] of `", stringify!($t), "` elements")]
                pub fn $get(&self, dest: &mut [$t], src: SymmetricPtr<$t>, pe: usize) {
                    self.get(dest, src, pe)
                }
                #[doc = concat!("[iput][Self::iput] of `", stringify!($t), "` elements")]
                pub fn $iput(
                    &self,
                    dest: SymmetricPtr<$t>,
                    src: &[$t],
                    dst: usize,
                    sst: usize,
                    nelems: usize,
                    pe: usize,
                ) {
                    self.iput(dest, src, dst, sst, nelems, pe)
                }
                #[doc = concat!("[iget][Self::iget] of `", stringify!($t), "` elements")]
                pub fn $iget(
                    &self,
                    dest: &mut [$t],
                    src: SymmetricPtr<$t>,
                    dst: usize,
                    sst: usize,
                    nelems: usize,
                    pe: usize,
                ) {
                    self.iget(dest, src, dst, sst, nelems, pe)
                }
            )*
        }
    };
}

width_rma! {
    u16: put16, get16, iput16, iget16;
    u32: put32, get32, iput32, iget32;
    u64: put64, get64, iput64, iget64;
    u128: put128, get128, iput128, iget128;
}

macro_rules! width_collectives {
    ($($t:ty: $bcast:ident, $collect:ident, $fcollect:ident, $alltoall:ident, $alltoalls:ident;)*) => {
        impl ShmemWorld {
            $(
                #[doc = concat!("[broadcast][Self::broadcast] of `", stringify!($t), "` elements")]
                pub fn $bcast(
                    &self,
                    dest: SymmetricPtr<$t>,
                    src: SymmetricPtr<$t>,
                    nelems: usize,
                    root: usize,
                    set: ActiveSet,
                    psync: SymmetricPtr<i64>,
                ) {
                    self.broadcast(dest, src, nelems, root, set, psync)
                }
                #[doc = concat!("[collect][Self::collect] of `", stringify!($t), "` elements")]
                pub fn $collect(
                    &self,
                    dest: SymmetricPtr<$t>,
                    src: SymmetricPtr<$t>,
                    nelems: usize,
                    set: ActiveSet,
                    psync: SymmetricPtr<i64>,
                ) {
                    self.collect(dest, src, nelems, set, psync)
                }
                #[doc = concat!("[fcollect][Self::fcollect] of `", stringify!($t), "` elements")]
                pub fn $fcollect(
                    &self,
                    dest: SymmetricPtr<$t>,
                    src: SymmetricPtr<$t>,
                    nelems: usize,
                    set: ActiveSet,
                    psync: SymmetricPtr<i64>,
                ) {
                    self.fcollect(dest, src, nelems, set, psync)
                }
                #[doc = concat!("[alltoall][Self::alltoall] of `", stringify!($t), "` elements")]
                pub fn $alltoall(
                    &self,
                    dest: SymmetricPtr<$t>,
                    src: SymmetricPtr<$t>,
                    nelems: usize,
                    set: ActiveSet,
                    psync: SymmetricPtr<i64>,
                ) {
                    self.alltoall(dest, src, nelems, set, psync)
                }
                #[doc = concat!("[alltoalls][Self::alltoalls] of `", stringify!($t), "` elements")]
                #[allow(clippy::too_many_arguments)]
                pub fn $alltoalls(
                    &self,
                    dest: SymmetricPtr<$t>,
                    src: SymmetricPtr<$t>,
                    dst: usize,
                    sst: usize,
                    nelems: usize,
                    set: ActiveSet,
                    psync: SymmetricPtr<i64>,
                ) {
                    self.alltoalls(dest, src, dst, sst, nelems, set, psync)
                }
            )*
        }
    };
}

width_collectives! {
    u32: broadcast32, collect32, fcollect32, alltoall32, alltoalls32;
    u64: broadcast64, collect64, fcollect64, alltoall64, alltoalls64;
}
