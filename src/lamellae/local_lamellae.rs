//! An in-process fabric: every PE is an OS thread of the calling process with its own segments,
//! its own active-message inbox and its own service thread.
pub(crate) mod am;
pub(crate) mod comm;
pub(crate) mod mem;
pub(crate) mod rdma;

use super::{AmHandler, Lamellae, LamellaeComm, LamellaeInit};
use crate::error::ShmemError;
use crate::progress::WaitMode;
use am::Command;
use comm::LocalFabric;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Largest symmetric heap a local pe hands out when no size is configured
pub(crate) const LOCAL_MAX_HEAP: usize = 16 * 1024 * 1024;

pub(crate) struct LocalBuilder {
    my_pe: usize,
    num_pes: usize,
    fabric: Arc<LocalFabric>,
}

impl LocalBuilder {
    /// joins the fabric installed on this thread by [launch][crate::launch], or creates a single pe fabric
    pub(crate) fn new() -> LocalBuilder {
        let (fabric, my_pe) = match comm::current() {
            Some(current) => current,
            None => (Arc::new(LocalFabric::new(1)), 0),
        };
        LocalBuilder {
            my_pe,
            num_pes: fabric.num_pes(),
            fabric,
        }
    }
}

impl LamellaeInit for LocalBuilder {
    fn init_fabric(&mut self) -> (usize, usize) {
        (self.my_pe, self.num_pes)
    }

    fn init_lamellae(
        &mut self,
        wait_mode: WaitMode,
        handler: Arc<dyn AmHandler>,
    ) -> Result<Arc<Lamellae>, ShmemError> {
        let (tx, rx) = unbounded();
        let lamellae = Arc::new(Lamellae::Local(Local {
            my_pe: self.my_pe,
            num_pes: self.num_pes,
            fabric: self.fabric.clone(),
            outbox: tx.clone(),
            outstanding: Arc::new(AtomicUsize::new(0)),
            service: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }));
        let Lamellae::Local(local) = &*lamellae;
        local.start_service(&lamellae, rx, wait_mode, handler)?;
        self.fabric.open_inbox(self.my_pe, tx);
        Ok(lamellae)
    }
}

pub(crate) struct Local {
    my_pe: usize,
    num_pes: usize,
    pub(crate) fabric: Arc<LocalFabric>,
    outbox: Sender<Command>,
    pub(crate) outstanding: Arc<AtomicUsize>,
    service: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Local(pe {} of {})", self.my_pe, self.num_pes)
    }
}

impl Local {
    fn start_service(
        &self,
        lamellae: &Arc<Lamellae>,
        rx: Receiver<Command>,
        wait_mode: WaitMode,
        handler: Arc<dyn AmHandler>,
    ) -> Result<(), ShmemError> {
        let weak = Arc::downgrade(lamellae);
        let fabric = self.fabric.clone();
        let outstanding = self.outstanding.clone();
        let my_pe = self.my_pe;
        let thread = std::thread::Builder::new()
            .name(format!("pe{}-svc", my_pe))
            .spawn(move || am::service(my_pe, weak, fabric, outstanding, rx, wait_mode, handler))
            .map_err(|e| ShmemError::TransportInit(e.to_string()))?;
        *self.service.lock() = Some(thread);
        Ok(())
    }

    pub(crate) fn outbox(&self) -> &Sender<Command> {
        &self.outbox
    }
}

impl LamellaeComm for Local {
    fn my_pe(&self) -> usize {
        self.my_pe
    }
    fn num_pes(&self) -> usize {
        self.num_pes
    }
    fn barrier(&self) -> Result<(), ShmemError> {
        self.fabric.barrier()
    }
    fn max_heap_size(&self) -> usize {
        LOCAL_MAX_HEAP
    }
    fn abort(&self, msg: &str) {
        self.fabric.abort(self.my_pe, msg);
    }
    fn check_abort(&self) -> Result<(), ShmemError> {
        self.fabric.check_abort()
    }
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fabric.close_inbox(self.my_pe);
        let _ = self.outbox.send(Command::Shutdown);
        if let Some(thread) = self.service.lock().take() {
            // the last reference may be dropped on the service thread itself
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        self.shutdown();
    }
}
