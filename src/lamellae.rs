//! The transport seam.
//!
//! Everything above this module talks to a [Lamellae] through three traits: [LamellaeComm] (rank, size,
//! barrier primitive, job abort), [LamellaeAM] (active-message send) and [LamellaeRDMA] (segment registration,
//! one-sided put/get, and word sized loads/stores). Inbound active messages are handed to the runtime's
//! [AmHandler] on a per-PE service thread owned by the backend.
use crate::error::ShmemError;
use crate::progress::{CompletionFlag, WaitMode};
use crate::symmetric::{SegmentId, SymAddr};

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) mod error;
use error::{AmResult, RdmaResult};

pub(crate) mod local_lamellae;
use local_lamellae::{Local, LocalBuilder};

/// The list of available lamellae backends, used to specify how data is transfered between PEs
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy)]
pub enum Backend {
    /// The Local backend -- every PE is a thread of the calling process (see [launch][crate::launch])
    Local,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Local
    }
}

/// Identifies the handler an active message is dispatched to on its target.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub(crate) enum AmId {
    AtomicRequest,
    AtomicReply,
    SegmentInfo,
    SegmentAck,
    Ping,
    Pong,
}

/// Executes inbound active messages on the target's service thread.
pub(crate) trait AmHandler: Send + Sync {
    /// The returned message, if any, is sent back to `src`.
    fn exec(
        &self,
        lamellae: &Lamellae,
        src: usize,
        id: AmId,
        payload: &[u8],
    ) -> Result<Option<(AmId, Vec<u8>)>, ShmemError>;
}

#[enum_dispatch(LamellaeInit)]
pub(crate) enum LamellaeBuilder {
    LocalBuilder,
}

#[enum_dispatch]
pub(crate) trait LamellaeInit {
    fn init_fabric(&mut self) -> (usize, usize); //(my_pe,num_pes)
    fn init_lamellae(
        &mut self,
        wait_mode: WaitMode,
        handler: Arc<dyn AmHandler>,
    ) -> Result<Arc<Lamellae>, ShmemError>;
}

#[enum_dispatch(LamellaeComm, LamellaeAM, LamellaeRDMA)]
#[derive(Debug)]
pub(crate) enum Lamellae {
    Local,
}

#[enum_dispatch]
pub(crate) trait LamellaeComm: LamellaeAM + LamellaeRDMA {
    fn my_pe(&self) -> usize;
    fn num_pes(&self) -> usize;
    // global barrier over every pe of the fabric
    fn barrier(&self) -> Result<(), ShmemError>;
    fn max_heap_size(&self) -> usize;
    /// mark the whole job as aborted, every pe's blocking waits will unwind
    fn abort(&self, msg: &str);
    fn check_abort(&self) -> Result<(), ShmemError>;
    fn shutdown(&self);
}

#[enum_dispatch]
pub(crate) trait LamellaeAM: Send + Sync {
    fn send_am(&self, pe: usize, id: AmId, payload: Vec<u8>) -> AmResult<()>;
}

#[enum_dispatch]
pub(crate) trait LamellaeRDMA: Send + Sync {
    /// allocate and publish one of the calling pe's segments, returns its base address
    fn register_segment(&self, segment: SegmentId, size: usize) -> RdmaResult<usize>;
    fn release_segments(&self);
    /// (base, size) of a segment as published by `pe`
    fn segment_info(&self, pe: usize, segment: SegmentId) -> RdmaResult<(usize, usize)>;
    fn put(&self, pe: usize, dst: SymAddr, src: &[u8]) -> RdmaResult<()>;
    fn get(&self, pe: usize, src: SymAddr, dst: &mut [u8]) -> RdmaResult<()>;
    /// `done` is completed (and the outstanding count decremented) once the data has landed
    fn put_nb(
        &self,
        pe: usize,
        dst: SymAddr,
        src: Vec<u8>,
        done: Option<Arc<CompletionFlag>>,
    ) -> RdmaResult<()>;
    /// fetch `len` bytes from `pe` into the calling pe's own segment at `dst`
    fn get_nb(
        &self,
        pe: usize,
        src: SymAddr,
        len: usize,
        dst: SymAddr,
        done: Option<Arc<CompletionFlag>>,
    ) -> RdmaResult<()>;
    /// nonblocking transfers initiated by this pe that have not landed yet
    fn outstanding(&self) -> usize;
    fn atomic_load(&self, pe: usize, addr: SymAddr, width: usize) -> RdmaResult<u128>;
    fn atomic_store(&self, pe: usize, addr: SymAddr, width: usize, val: u128) -> RdmaResult<()>;
    /// raw pointer to the calling pe's copy of `len` bytes at `addr`
    fn local_ptr(&self, addr: SymAddr, len: usize) -> RdmaResult<*mut u8>;
}

pub(crate) fn create_lamellae(backend: Backend) -> LamellaeBuilder {
    match backend {
        Backend::Local => LamellaeBuilder::LocalBuilder(LocalBuilder::new()),
    }
}
