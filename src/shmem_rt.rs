//! The per-PE runtime context.
//!
//! A [ShmemRT] is created by [ShmemWorldBuilder::build][crate::ShmemWorldBuilder::build] and shared (via
//! `Arc`) by the world handle and every outstanding nonblocking handle. It owns the transport, the
//! symmetric segments and their allocator, the active-message handler state and the internal
//! scratch objects used by collectives issued on the runtime's own behalf.
use crate::atomic::{AtomicEngine, AtomicReply, AtomicRequest};
use crate::collectives::registry::Algorithms;
use crate::collectives::{BARRIER_SYNC_SIZE, BCAST_SYNC_SIZE, REDUCE_SYNC_SIZE, SYNC_VALUE};
use crate::env_var::SegmentExchange;
use crate::error::{MallocStatus, ShmemError};
use crate::lamellae::{
    create_lamellae, AmHandler, AmId, Backend, Lamellae, LamellaeAM, LamellaeComm, LamellaeInit,
    LamellaeRDMA,
};
use crate::progress::{Comparator, CompletionFlag, PendingReplies, Waiter, WaitMode};
use crate::shmem_alloc::BTreeAlloc;
use crate::symmetric::{SegmentId, SegmentInfo, SegmentTable, SymAddr, SymmetricPtr};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Runtime settings, resolved from the environment and the builder's overrides.
#[derive(Debug, Clone)]
pub(crate) struct RtConfig {
    pub(crate) backend: Backend,
    pub(crate) heap_size: Option<usize>,
    pub(crate) static_size: usize,
    pub(crate) wait_mode: WaitMode,
    pub(crate) segment_exchange: SegmentExchange,
    pub(crate) barrier_algorithm: String,
    pub(crate) broadcast_algorithm: String,
    pub(crate) collect_algorithm: String,
    pub(crate) fcollect_algorithm: String,
    pub(crate) alltoall_algorithm: String,
    pub(crate) symmetric_check: bool,
    pub(crate) lock_legacy_zero: bool,
    pub(crate) ping_timeout: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct SegmentMsg {
    id: u64,
    info: SegmentInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct AckMsg {
    id: u64,
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ShmemError> {
    bincode::deserialize(payload).map_err(|e| ShmemError::Payload(e.to_string()))
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ShmemError> {
    bincode::serialize(msg).map_err(|e| ShmemError::Payload(e.to_string()))
}

/// Handler state reachable from the service thread.
pub(crate) struct RtHandler {
    my_pe: usize,
    pub(crate) pending: PendingReplies,
    pub(crate) atomics: AtomicEngine,
    pub(crate) segments: RwLock<SegmentTable>,
}

impl RtHandler {
    fn new(my_pe: usize, num_pes: usize) -> RtHandler {
        RtHandler {
            my_pe,
            pending: PendingReplies::new(),
            atomics: AtomicEngine::new(),
            segments: RwLock::new(SegmentTable::new(my_pe, num_pes)),
        }
    }
}

impl AmHandler for RtHandler {
    fn exec(
        &self,
        lamellae: &Lamellae,
        src: usize,
        id: AmId,
        payload: &[u8],
    ) -> Result<Option<(AmId, Vec<u8>)>, ShmemError> {
        match id {
            AmId::AtomicRequest => {
                let req: AtomicRequest = decode(payload)?;
                let old = self.atomics.execute(lamellae, self.my_pe, &req)?;
                let reply = AtomicReply { id: req.id, old };
                Ok(Some((AmId::AtomicReply, encode(&reply)?)))
            }
            AmId::AtomicReply => {
                let reply: AtomicReply = decode(payload)?;
                if reply.id == 0 {
                    self.atomics.acked();
                } else {
                    self.pending.complete(reply.id, reply.old);
                }
                Ok(None)
            }
            AmId::SegmentInfo => {
                let msg: SegmentMsg = decode(payload)?;
                trace!("pe {} learned {:?} of pe {}", self.my_pe, msg.info, src);
                self.segments.write().insert(src, msg.info);
                Ok(Some((AmId::SegmentAck, encode(&AckMsg { id: msg.id })?)))
            }
            AmId::SegmentAck | AmId::Pong => {
                let ack: AckMsg = decode(payload)?;
                self.pending.complete(ack.id, 0);
                Ok(None)
            }
            AmId::Ping => Ok(Some((AmId::Pong, payload.to_vec()))),
        }
    }
}

/// Symmetric objects the runtime allocates for itself at init, in the same order on every pe.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scratch {
    pub(crate) barrier_psync: SymmetricPtr<i64>,
    pub(crate) bcast_psync: SymmetricPtr<i64>,
    pub(crate) reduce_psync: SymmetricPtr<i64>,
    pub(crate) size_src: SymmetricPtr<i64>,
    pub(crate) size_dst: SymmetricPtr<i64>,
    pub(crate) vote_src: SymmetricPtr<i64>,
    pub(crate) vote_dst: SymmetricPtr<i64>,
}

impl Scratch {
    const PSYNC_LEN: usize = BARRIER_SYNC_SIZE + BCAST_SYNC_SIZE + REDUCE_SYNC_SIZE;
    const BYTES: usize = (Self::PSYNC_LEN + 4) * std::mem::size_of::<i64>();

    fn layout() -> Scratch {
        let mut offset = 0;
        let mut next = |len: usize| {
            let ptr = SymmetricPtr::from_addr(SymAddr::new(SegmentId::Static, offset), len);
            offset += len * std::mem::size_of::<i64>();
            ptr
        };
        Scratch {
            barrier_psync: next(BARRIER_SYNC_SIZE),
            bcast_psync: next(BCAST_SYNC_SIZE),
            reduce_psync: next(REDUCE_SYNC_SIZE),
            size_src: next(1),
            size_dst: next(1),
            vote_src: next(1),
            vote_dst: next(1),
        }
    }

    fn psyncs(&self) -> [SymmetricPtr<i64>; 3] {
        [self.barrier_psync, self.bcast_psync, self.reduce_psync]
    }
}

pub(crate) struct ShmemRT {
    pub(crate) my_pe: usize,
    pub(crate) num_pes: usize,
    pub(crate) lamellae: Arc<Lamellae>,
    pub(crate) am: Arc<RtHandler>,
    pub(crate) heap: BTreeAlloc,
    pub(crate) statics_next: Mutex<usize>,
    pub(crate) static_size: usize,
    pub(crate) handles: PendingReplies,
    pub(crate) algorithms: Algorithms,
    pub(crate) scratch: Scratch,
    pub(crate) config: RtConfig,
    pub(crate) last_error: AtomicU8,
    finalized: AtomicBool,
}

impl std::fmt::Debug for ShmemRT {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmemRT(pe {} of {})", self.my_pe, self.num_pes)
    }
}

impl ShmemRT {
    #[tracing::instrument(skip_all)]
    pub(crate) fn new(config: RtConfig) -> Arc<ShmemRT> {
        let mut lamellae_builder = create_lamellae(config.backend);
        let (my_pe, num_pes) = lamellae_builder.init_fabric();
        let am = Arc::new(RtHandler::new(my_pe, num_pes));
        let lamellae = match lamellae_builder.init_lamellae(config.wait_mode, am.clone()) {
            Ok(lamellae) => lamellae,
            Err(e) => {
                error!("pe {} unable to initialize the transport: {}", my_pe, e);
                panic!("[RSHMEM] pe {}: {}", my_pe, e);
            }
        };
        let heap_size = config.heap_size.unwrap_or_else(|| lamellae.max_heap_size());
        let static_size = Scratch::BYTES + config.static_size;
        let register = |segment: SegmentId, size: usize| -> Result<SegmentInfo, ShmemError> {
            let base = lamellae
                .register_segment(segment, size)
                .map_err(|e| ShmemError::TransportInit(e.to_string()))?;
            Ok(SegmentInfo {
                segment,
                base,
                size,
            })
        };
        let infos = match (
            register(SegmentId::Heap, heap_size),
            register(SegmentId::Static, static_size),
        ) {
            (Ok(heap), Ok(statics)) => [heap, statics],
            (Err(e), _) | (_, Err(e)) => fatal_error(&lamellae, my_pe, e),
        };
        {
            let mut table = am.segments.write();
            for info in infos {
                table.insert(my_pe, info);
            }
        }
        let scratch = Scratch::layout();
        for psync in scratch.psyncs() {
            for i in 0..psync.len() {
                let rest = SYNC_VALUE as u64 as u128;
                if let Err(e) = lamellae.atomic_store(my_pe, psync.elem(i), 8, rest) {
                    fatal_error(&lamellae, my_pe, e.into());
                }
            }
        }
        // every pe has registered its segments and opened its inbox past this point
        if let Err(e) = lamellae.barrier() {
            fatal_error(&lamellae, my_pe, e);
        }
        let exchanged = match config.segment_exchange {
            SegmentExchange::Transport => exchange_from_transport(&lamellae, &am, num_pes),
            SegmentExchange::Handshake => {
                exchange_handshake(&lamellae, &am, &infos, config.wait_mode)
            }
        };
        if let Err(e) = exchanged.and_then(|_| am.segments.read().check_sizes()) {
            fatal_error(&lamellae, my_pe, e);
        }

        let mut heap = BTreeAlloc::new(format!("pe{}_heap", my_pe));
        heap.init(0, heap_size);
        let algorithms = Algorithms::select(&config);
        let rt = Arc::new(ShmemRT {
            my_pe,
            num_pes,
            lamellae,
            am,
            heap,
            statics_next: Mutex::new(Scratch::BYTES),
            static_size,
            handles: PendingReplies::new(),
            algorithms,
            scratch,
            config,
            last_error: AtomicU8::new(MallocStatus::Ok.code()),
            finalized: AtomicBool::new(false),
        });
        if let Err(e) = rt.lamellae.barrier() {
            rt.fatal(e);
        }
        info!(
            "pe {} of {} up: heap {} bytes, static {} bytes, {:?}",
            my_pe, num_pes, heap_size, static_size, rt.algorithms
        );
        rt
    }

    /// Log `err`, abort the job and unwind the calling pe.
    pub(crate) fn fatal(&self, err: ShmemError) -> ! {
        fatal_error(&self.lamellae, self.my_pe, err)
    }

    pub(crate) fn check_pe(&self, pe: usize) {
        if pe >= self.num_pes {
            self.fatal(ShmemError::PeOutOfRange {
                pe,
                num_pes: self.num_pes,
            });
        }
    }

    pub(crate) fn check_live(&self) {
        if self.finalized.load(Ordering::Acquire) {
            self.fatal(ShmemError::Finalized);
        }
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub(crate) fn waiter<'a>(&'a self, what: &'a str) -> Waiter<'a> {
        Waiter::new(self.config.wait_mode, &self.lamellae, what)
    }

    pub(crate) fn put_bytes(&self, pe: usize, dst: SymAddr, src: &[u8]) {
        self.check_live();
        self.check_pe(pe);
        if let Err(e) = self.lamellae.put(pe, dst, src) {
            self.fatal(e.into());
        }
    }

    pub(crate) fn get_bytes(&self, pe: usize, src: SymAddr, dst: &mut [u8]) {
        self.check_live();
        self.check_pe(pe);
        if let Err(e) = self.lamellae.get(pe, src, dst) {
            self.fatal(e.into());
        }
    }

    /// get into a freshly allocated buffer
    pub(crate) fn get_vec(&self, pe: usize, src: SymAddr, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.get_bytes(pe, src, &mut buf);
        buf
    }

    /// single word store, never torn
    pub(crate) fn put_word(&self, pe: usize, dst: SymAddr, width: usize, val: u128) {
        self.check_live();
        self.check_pe(pe);
        if let Err(e) = self.lamellae.atomic_store(pe, dst, width, val) {
            self.fatal(e.into());
        }
    }

    pub(crate) fn get_word(&self, pe: usize, src: SymAddr, width: usize) -> u128 {
        self.check_live();
        self.check_pe(pe);
        match self.lamellae.atomic_load(pe, src, width) {
            Ok(val) => val,
            Err(e) => self.fatal(e.into()),
        }
    }

    pub(crate) fn put_nb_bytes(
        &self,
        pe: usize,
        dst: SymAddr,
        data: Vec<u8>,
        done: Option<Arc<CompletionFlag>>,
    ) {
        self.check_live();
        self.check_pe(pe);
        if let Err(e) = self.lamellae.put_nb(pe, dst, data, done) {
            self.fatal(e.into());
        }
    }

    /// nonblocking get of `len` bytes from `pe` into the calling pe's `dst`
    pub(crate) fn get_nb_bytes(
        &self,
        pe: usize,
        src: SymAddr,
        len: usize,
        dst: SymAddr,
        done: Option<Arc<CompletionFlag>>,
    ) {
        self.check_live();
        self.check_pe(pe);
        if let Err(e) = self.lamellae.get_nb(pe, src, len, dst, done) {
            self.fatal(e.into());
        }
    }

    pub(crate) fn put_i64(&self, pe: usize, dst: SymAddr, val: i64) {
        self.put_word(pe, dst, 8, val as u64 as u128);
    }

    pub(crate) fn get_i64(&self, pe: usize, src: SymAddr) -> i64 {
        self.get_word(pe, src, 8) as u64 as i64
    }

    /// Block until the local word at `addr` satisfies `pred`, returns the value that did.
    pub(crate) fn wait_word(
        &self,
        addr: SymAddr,
        width: usize,
        what: &str,
        pred: impl Fn(u128) -> bool,
    ) -> u128 {
        let mut seen = 0;
        self.waiter(what).spin_until(|| {
            seen = self.get_word(self.my_pe, addr, width);
            pred(seen)
        });
        seen
    }

    pub(crate) fn wait_i64(&self, addr: SymAddr, cmp: Comparator, value: i64) -> i64 {
        self.wait_word(addr, 8, "a wait on a sync cell", |bits| {
            cmp.compare(bits as u64 as i64, value)
        }) as u64 as i64
    }

    pub(crate) fn local_ptr(&self, addr: SymAddr, len: usize) -> *mut u8 {
        match self.lamellae.local_ptr(addr, len) {
            Ok(ptr) => ptr,
            Err(e) => self.fatal(e.into()),
        }
    }

    /// wait for every nonblocking transfer and posted atomic issued by this pe
    pub(crate) fn quiet(&self) {
        self.waiter("quiet").spin_until(|| {
            self.lamellae.outstanding() == 0 && self.am.atomics.in_flight() == 0
        });
        fence(Ordering::SeqCst);
    }

    pub(crate) fn barrier_all(&self) {
        self.quiet();
        let world = crate::ActiveSet::world(self.num_pes);
        (self.algorithms.barrier.1)(self, &world, self.my_pe, self.scratch.barrier_psync);
    }

    /// reachability probe: a ping that must be answered before the configured deadline
    pub(crate) fn pe_accessible(&self, pe: usize) -> bool {
        if pe >= self.num_pes || self.is_finalized() {
            return false;
        }
        if pe == self.my_pe {
            return true;
        }
        let reply = self.am.pending.register();
        let payload = match encode(&AckMsg { id: reply.id }) {
            Ok(payload) => payload,
            Err(e) => self.fatal(e),
        };
        if let Err(e) = self.lamellae.send_am(pe, AmId::Ping, payload) {
            debug!("pe {} is not accessible: {}", pe, e);
            return false;
        }
        let deadline = Instant::now() + self.config.ping_timeout;
        reply
            .flag
            .wait_deadline(&self.waiter("a ping"), Some(deadline))
            .is_some()
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn finalize(&self) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        self.barrier_all();
        // acks for the increments posted by the barrier itself
        self.quiet();
        self.finalized.store(true, Ordering::Release);
        // nobody will address our segments once every pe is past this point
        if let Err(e) = self.lamellae.barrier() {
            self.fatal(e);
        }
        debug_assert_eq!(
            self.am.atomics.in_flight(),
            0,
            "pe {} finalized with posted atomics unacknowledged",
            self.my_pe
        );
        self.lamellae.shutdown();
        self.lamellae.release_segments();
        debug!("pe {} finalized", self.my_pe);
    }

    /// tear down without synchronizing, used when the pe unwinds
    pub(crate) fn abandon(&self, reason: &str) {
        if !self.finalized.swap(true, Ordering::AcqRel) {
            self.lamellae.abort(reason);
            self.lamellae.shutdown();
        }
    }
}

pub(crate) fn fatal_error(lamellae: &Lamellae, my_pe: usize, err: ShmemError) -> ! {
    if !matches!(err, ShmemError::Aborted { .. }) {
        error!("pe {} fatal error: {}", my_pe, err);
    }
    lamellae.abort(&err.to_string());
    panic!("[RSHMEM] pe {}: {}", my_pe, err)
}

fn exchange_from_transport(
    lamellae: &Lamellae,
    am: &RtHandler,
    num_pes: usize,
) -> Result<(), ShmemError> {
    let mut table = am.segments.write();
    for pe in 0..num_pes {
        for segment in [SegmentId::Heap, SegmentId::Static] {
            let (base, size) = lamellae.segment_info(pe, segment)?;
            table.insert(pe, SegmentInfo { segment, base, size });
        }
    }
    Ok(())
}

fn exchange_handshake(
    lamellae: &Lamellae,
    am: &RtHandler,
    infos: &[SegmentInfo],
    wait_mode: WaitMode,
) -> Result<(), ShmemError> {
    let my_pe = lamellae.my_pe();
    let mut replies = Vec::new();
    for pe in (0..lamellae.num_pes()).filter(|pe| *pe != my_pe) {
        for info in infos {
            let reply = am.pending.register();
            let msg = encode(&SegmentMsg { id: reply.id, info: *info })?;
            lamellae.send_am(pe, AmId::SegmentInfo, msg)?;
            replies.push(reply);
        }
    }
    let waiter = Waiter::new(wait_mode, lamellae, "the segment exchange");
    for reply in &replies {
        reply.flag.wait(&waiter);
    }
    // acks only say our info landed; wait until everyone else's has landed here too
    waiter.spin_until(|| am.segments.read().is_complete());
    Ok(())
}
