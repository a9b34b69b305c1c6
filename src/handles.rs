//! Handles for nonblocking put/get.
use crate::progress::CompletionFlag;
use crate::shmem_rt::ShmemRT;
use crate::warnings::RuntimeWarning;

use futures::Future;
use std::pin::Pin;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// An in-flight nonblocking put or get, returned by [put_nb][crate::ShmemWorld::put_nb] and
/// [get_nb][crate::ShmemWorld::get_nb].
///
/// The transfer is tracked in the world's handle table until the handle is waited on (with
/// [wait][RdmaHandle::wait] or by awaiting it) or dropped. Dropping a handle that was never waited on
/// does not cancel the transfer; [quiet][crate::ShmemWorld::quiet] still covers it, but a warning is
/// printed since the completion can no longer be observed through the handle.
#[must_use = "a nonblocking transfer handle must be waited on (or awaited), dropping it only leaves quiet() to observe completion"]
pub struct RdmaHandle {
    id: u64,
    flag: Arc<CompletionFlag>,
    rt: Arc<ShmemRT>,
    waited: bool,
}

impl std::fmt::Debug for RdmaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RdmaHandle({}, done: {})", self.id, self.flag.is_done())
    }
}

impl RdmaHandle {
    pub(crate) fn new(rt: Arc<ShmemRT>) -> RdmaHandle {
        let (id, flag) = rt.handles.register_detached();
        RdmaHandle {
            id,
            flag,
            rt,
            waited: false,
        }
    }

    pub(crate) fn flag(&self) -> Arc<CompletionFlag> {
        self.flag.clone()
    }

    /// Block until the transfer has completed, then fence so later operations are ordered after it.
    pub fn wait(mut self) {
        self.flag
            .wait(&self.rt.waiter("a nonblocking put/get handle"));
        self.waited = true;
        fence(Ordering::SeqCst);
    }

    /// Returns true if the transfer has completed, without blocking.
    pub fn test(&self) -> bool {
        self.flag.is_done()
    }
}

impl Future for RdmaHandle {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.flag.is_done() {
            self.flag.register_waker(cx.waker());
            if !self.flag.is_done() {
                return Poll::Pending;
            }
        }
        self.waited = true;
        fence(Ordering::SeqCst);
        Poll::Ready(())
    }
}

impl Drop for RdmaHandle {
    fn drop(&mut self) {
        self.rt.handles.release(self.id);
        if !self.waited && !std::thread::panicking() {
            RuntimeWarning::DroppedHandle("a nonblocking put/get handle").print();
        }
    }
}
