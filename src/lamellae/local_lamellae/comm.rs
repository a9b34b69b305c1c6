use super::am::Command;
use super::mem::SegmentMem;
use crate::error::ShmemError;
use crate::symmetric::SegmentId;

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

thread_local! {
    static CURRENT: RefCell<Option<(Arc<LocalFabric>, usize)>> = RefCell::new(None);
}

/// install `fabric` as the one the calling thread joins as `pe`
pub(crate) fn set_current(fabric: Arc<LocalFabric>, pe: usize) {
    CURRENT.with(|c| *c.borrow_mut() = Some((fabric, pe)));
}

pub(crate) fn current() -> Option<(Arc<LocalFabric>, usize)> {
    CURRENT.with(|c| c.borrow().clone())
}

#[derive(Default)]
pub(crate) struct PeSlot {
    pub(crate) inbox: RwLock<Option<Sender<Command>>>,
    pub(crate) segments: RwLock<HashMap<SegmentId, Arc<SegmentMem>>>,
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// State shared by every pe of one in-process job.
pub(crate) struct LocalFabric {
    num_pes: usize,
    pub(crate) slots: Vec<PeSlot>,
    barrier: Mutex<BarrierState>,
    barrier_cvar: Condvar,
    aborted: AtomicBool,
    abort_info: Mutex<Option<(usize, String)>>,
}

impl LocalFabric {
    pub(crate) fn new(num_pes: usize) -> LocalFabric {
        LocalFabric {
            num_pes,
            slots: (0..num_pes).map(|_| PeSlot::default()).collect(),
            barrier: Mutex::new(BarrierState::default()),
            barrier_cvar: Condvar::new(),
            aborted: AtomicBool::new(false),
            abort_info: Mutex::new(None),
        }
    }

    pub(crate) fn num_pes(&self) -> usize {
        self.num_pes
    }

    pub(crate) fn open_inbox(&self, pe: usize, tx: Sender<Command>) {
        *self.slots[pe].inbox.write() = Some(tx);
    }

    pub(crate) fn close_inbox(&self, pe: usize) {
        self.slots[pe].inbox.write().take();
    }

    pub(crate) fn inbox(&self, pe: usize) -> Option<Sender<Command>> {
        self.slots.get(pe).and_then(|slot| slot.inbox.read().clone())
    }

    pub(crate) fn segment(&self, pe: usize, segment: SegmentId) -> Option<Arc<SegmentMem>> {
        self.slots
            .get(pe)
            .and_then(|slot| slot.segments.read().get(&segment).cloned())
    }

    /// generation counting barrier over every pe, unwinds if the job is aborted while waiting
    pub(crate) fn barrier(&self) -> Result<(), ShmemError> {
        let mut state = self.barrier.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.num_pes {
            state.arrived = 0;
            state.generation = generation.wrapping_add(1);
            self.barrier_cvar.notify_all();
            return Ok(());
        }
        while state.generation == generation {
            self.check_abort()?;
            self.barrier_cvar
                .wait_for(&mut state, Duration::from_millis(10));
        }
        Ok(())
    }

    pub(crate) fn abort(&self, pe: usize, msg: &str) {
        {
            let mut info = self.abort_info.lock();
            if info.is_none() {
                *info = Some((pe, msg.to_owned()));
            }
        }
        self.aborted.store(true, Ordering::SeqCst);
        let _guard = self.barrier.lock();
        self.barrier_cvar.notify_all();
    }

    pub(crate) fn check_abort(&self) -> Result<(), ShmemError> {
        if self.aborted.load(Ordering::Relaxed) {
            let (pe, msg) = self
                .abort_info
                .lock()
                .clone()
                .unwrap_or((usize::MAX, String::from("unknown")));
            Err(ShmemError::Aborted { pe, msg })
        } else {
            Ok(())
        }
    }

    /// the pe that aborted the job first
    pub(crate) fn abort_origin(&self) -> Option<usize> {
        self.abort_info.lock().as_ref().map(|(pe, _)| *pe)
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_releases_every_generation() {
        let fabric = Arc::new(LocalFabric::new(4));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let fabric = fabric.clone();
                s.spawn(move || {
                    for _ in 0..50 {
                        fabric.barrier().unwrap();
                    }
                });
            }
        });
        assert_eq!(fabric.barrier.lock().generation, 50);
    }

    #[test]
    fn abort_unwinds_a_waiting_barrier() {
        let fabric = Arc::new(LocalFabric::new(2));
        let waiter = {
            let fabric = fabric.clone();
            std::thread::spawn(move || fabric.barrier())
        };
        std::thread::sleep(Duration::from_millis(20));
        fabric.abort(1, "boom");
        match waiter.join().unwrap() {
            Err(ShmemError::Aborted { pe, msg }) => {
                assert_eq!(pe, 1);
                assert_eq!(msg, "boom");
            }
            other => panic!("unexpected barrier result {:?}", other),
        }
    }
}
