//! Blocking primitives shared by every component: completion markers, the pending-reply table used to
//! route active-message replies back to their initiator, and the wait loop that honours the configured
//! [WaitMode], notices a job abort, and warns about potential deadlocks.
pub use crate::env_var::WaitMode;
use crate::lamellae::{Lamellae, LamellaeComm};
use crate::warnings::RuntimeWarning;

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

const SPIN_POLLS: usize = 4096;
const CHECK_INTERVAL: usize = 1024;

/// Comparison operators accepted by `wait_until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Le,
    Lt,
    Ge,
}

impl Comparator {
    /// evaluates `lhs <op> rhs`
    pub fn compare<T: PartialOrd>(&self, lhs: T, rhs: T) -> bool {
        match self {
            Comparator::Eq => lhs == rhs,
            Comparator::Ne => lhs != rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Lt => lhs < rhs,
            Comparator::Ge => lhs >= rhs,
        }
    }
}

/// A one shot completion marker, set by a reply handler (or the transport) and waited on by the initiator.
pub(crate) struct CompletionFlag {
    done: AtomicBool,
    value: Mutex<u128>,
    cvar: Condvar,
    waker: Mutex<Option<Waker>>,
}

impl std::fmt::Debug for CompletionFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompletionFlag({})", self.is_done())
    }
}

impl CompletionFlag {
    pub(crate) fn new() -> Arc<CompletionFlag> {
        Arc::new(CompletionFlag {
            done: AtomicBool::new(false),
            value: Mutex::new(0),
            cvar: Condvar::new(),
            waker: Mutex::new(None),
        })
    }

    pub(crate) fn complete(&self, value: u128) {
        {
            let mut v = self.value.lock();
            *v = value;
            self.done.store(true, Ordering::Release);
            self.cvar.notify_all();
        }
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn value(&self) -> u128 {
        *self.value.lock()
    }

    pub(crate) fn register_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        *slot = Some(waker.clone());
        drop(slot);
        // completion may have raced with the registration
        if self.is_done() {
            if let Some(waker) = self.waker.lock().take() {
                waker.wake();
            }
        }
    }

    /// block until the flag is set and return the value it carries
    pub(crate) fn wait(&self, waiter: &Waiter<'_>) -> u128 {
        match self.wait_deadline(waiter, None) {
            Some(v) => v,
            None => unreachable!("a wait without deadline cannot time out"),
        }
    }

    /// block until the flag is set or `deadline` passes (returns None on expiry)
    pub(crate) fn wait_deadline(
        &self,
        waiter: &Waiter<'_>,
        deadline: Option<Instant>,
    ) -> Option<u128> {
        if waiter.mode == WaitMode::Block {
            let start = Instant::now();
            let mut warned_at = start;
            let mut v = self.value.lock();
            while !self.done.load(Ordering::Acquire) {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
                self.cvar.wait_for(&mut v, Duration::from_millis(1));
                waiter.check(&mut warned_at);
            }
            Some(*v)
        } else {
            let completed = waiter.spin_until_deadline(|| self.is_done(), deadline);
            completed.then(|| self.value())
        }
    }
}

/// Table of outstanding requests awaiting a reply, keyed by the id carried in the request payload.
#[derive(Debug)]
pub(crate) struct PendingReplies {
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, Arc<CompletionFlag>>>,
}

/// A registered entry of [PendingReplies]; the entry is released when this guard is dropped, on every path.
pub(crate) struct PendingReply<'a> {
    pub(crate) id: u64,
    pub(crate) flag: Arc<CompletionFlag>,
    table: &'a PendingReplies,
}

impl PendingReplies {
    pub(crate) fn new() -> PendingReplies {
        PendingReplies {
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self) -> PendingReply<'_> {
        let (id, flag) = self.register_detached();
        PendingReply {
            id,
            flag,
            table: self,
        }
    }

    /// an entry whose owner is responsible for calling [release][Self::release]
    pub(crate) fn register_detached(&self) -> (u64, Arc<CompletionFlag>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flag = CompletionFlag::new();
        self.table.lock().insert(id, flag.clone());
        (id, flag)
    }

    pub(crate) fn release(&self, id: u64) -> bool {
        self.table.lock().remove(&id).is_some()
    }

    /// returns false if nobody is waiting on `id` anymore (e.g. a ping that already timed out)
    pub(crate) fn complete(&self, id: u64, value: u128) -> bool {
        let flag = self.table.lock().get(&id).cloned();
        match flag {
            Some(flag) => {
                flag.complete(value);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

/// Polling policy for one blocking call.
pub(crate) struct Waiter<'a> {
    pub(crate) mode: WaitMode,
    lamellae: &'a Lamellae,
    what: &'a str,
    timeout: f64,
}

impl<'a> Waiter<'a> {
    pub(crate) fn new(mode: WaitMode, lamellae: &'a Lamellae, what: &'a str) -> Waiter<'a> {
        Waiter {
            mode,
            lamellae,
            what,
            timeout: crate::config().deadlock_timeout,
        }
    }

    /// panics if the job was aborted, and prints a warning every deadlock-timeout period
    fn check(&self, warned_at: &mut Instant) {
        if let Err(e) = self.lamellae.check_abort() {
            panic!("{}", e);
        }
        let elapsed = warned_at.elapsed().as_secs_f64();
        if self.timeout > 0.0 && elapsed > self.timeout {
            RuntimeWarning::WaitTimeout(self.what, elapsed).print();
            *warned_at = Instant::now();
        }
    }

    pub(crate) fn spin_until(&self, cond: impl FnMut() -> bool) {
        self.spin_until_deadline(cond, None);
    }

    /// returns false if `deadline` passed before `cond` held
    pub(crate) fn spin_until_deadline(
        &self,
        mut cond: impl FnMut() -> bool,
        deadline: Option<Instant>,
    ) -> bool {
        let mut polls: usize = 0;
        let mut warned_at = Instant::now();
        loop {
            if cond() {
                return true;
            }
            polls += 1;
            if polls == 1 || polls % CHECK_INTERVAL == 0 {
                self.check(&mut warned_at);
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return false;
                    }
                }
            }
            match self.mode {
                WaitMode::Spin => std::hint::spin_loop(),
                WaitMode::SpinBlock => {
                    if polls < SPIN_POLLS {
                        std::hint::spin_loop()
                    } else {
                        std::thread::yield_now()
                    }
                }
                WaitMode::Block => {
                    if polls < 16 {
                        std::thread::yield_now()
                    } else {
                        std::thread::sleep(Duration::from_micros(20))
                    }
                }
            }
        }
    }
}
