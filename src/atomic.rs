//! Remote atomics as active-message RPCs.
//!
//! The initiator packs an [AtomicRequest] and sends it to the target PE; the target's service thread
//! performs the read-modify-write under a lock dedicated to the (operation, width) pair, fences, and
//! replies with the prior value. Every atomic, including one that targets the calling PE, takes this
//! path, so all updates of a cell are serialized at its owner.
//!
//! Values travel as `u128` bit patterns masked to the operation's width; arithmetic wraps at that width.
use crate::error::ShmemError;
use crate::lamellae::{AmId, Lamellae, LamellaeAM, LamellaeRDMA};
use crate::shmem_rt::ShmemRT;
use crate::symmetric::SymAddr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use tracing::trace;

/// The read-modify-write operations understood by the target side handler.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum AtomicOp {
    Swap,
    Cswap,
    Fadd,
    Finc,
    Add,
    Inc,
    Fetch,
    Set,
}

impl AtomicOp {
    const ALL: [AtomicOp; 8] = [
        AtomicOp::Swap,
        AtomicOp::Cswap,
        AtomicOp::Fadd,
        AtomicOp::Finc,
        AtomicOp::Add,
        AtomicOp::Inc,
        AtomicOp::Fetch,
        AtomicOp::Set,
    ];

    fn index(&self) -> usize {
        *self as usize
    }

    /// ops whose initiator does not wait for the prior value
    pub(crate) fn is_posted(&self) -> bool {
        matches!(self, AtomicOp::Add | AtomicOp::Inc | AtomicOp::Set)
    }

    /// the value written for `old`, or None if the cell is left untouched
    pub(crate) fn apply(&self, width: usize, old: u128, value: u128, cond: u128) -> Option<u128> {
        let mask = width_mask(width);
        match self {
            AtomicOp::Swap | AtomicOp::Set => Some(value & mask),
            AtomicOp::Cswap => {
                if old & mask == cond & mask {
                    Some(value & mask)
                } else {
                    None
                }
            }
            AtomicOp::Fadd | AtomicOp::Add => Some(old.wrapping_add(value) & mask),
            AtomicOp::Finc | AtomicOp::Inc => Some(old.wrapping_add(1) & mask),
            AtomicOp::Fetch => None,
        }
    }
}

const WIDTHS: [usize; 3] = [4, 8, 16];

fn width_index(width: usize) -> Option<usize> {
    WIDTHS.iter().position(|w| *w == width)
}

pub(crate) fn width_mask(width: usize) -> u128 {
    if width >= 16 {
        u128::MAX
    } else {
        (1u128 << (width * 8)) - 1
    }
}

/// Wire format of a remote atomic.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AtomicRequest {
    /// completion id in the initiator's pending-reply table, 0 for posted ops
    pub(crate) id: u64,
    pub(crate) target: SymAddr,
    pub(crate) op: AtomicOp,
    pub(crate) width: u8,
    pub(crate) value: u128,
    pub(crate) cond: u128,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AtomicReply {
    pub(crate) id: u64,
    pub(crate) old: u128,
}

/// Target side state: one lock per (operation, width), plus the initiator side count of posted ops
/// that have not been acknowledged yet.
pub(crate) struct AtomicEngine {
    locks: Vec<Mutex<()>>,
    in_flight: AtomicUsize,
}

impl std::fmt::Debug for AtomicEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AtomicEngine(in flight {})", self.in_flight())
    }
}

impl AtomicEngine {
    pub(crate) fn new() -> AtomicEngine {
        AtomicEngine {
            locks: (0..AtomicOp::ALL.len() * WIDTHS.len())
                .map(|_| Mutex::new(()))
                .collect(),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn lock_for(&self, op: AtomicOp, width: usize) -> Option<&Mutex<()>> {
        width_index(width).map(|w| &self.locks[op.index() * WIDTHS.len() + w])
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn posted(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn acked(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Execute `req` against the calling PE's memory and return the prior value.
    pub(crate) fn execute(
        &self,
        lamellae: &Lamellae,
        my_pe: usize,
        req: &AtomicRequest,
    ) -> Result<u128, ShmemError> {
        let width = req.width as usize;
        let lock = self
            .lock_for(req.op, width)
            .ok_or_else(|| ShmemError::Payload(format!("unsupported atomic width {}", width)))?;
        let _guard = lock.lock();
        let old = lamellae.atomic_load(my_pe, req.target, width)?;
        if let Some(new) = req.op.apply(width, old, req.value, req.cond) {
            lamellae.atomic_store(my_pe, req.target, width, new)?;
        }
        fence(Ordering::SeqCst);
        trace!("atomic {:?} w{} at {:?}: {:#x}", req.op, width, req.target, old);
        Ok(old)
    }
}

impl ShmemRT {
    fn atomic_request(
        &self,
        pe: usize,
        target: SymAddr,
        op: AtomicOp,
        width: usize,
        id: u64,
        value: u128,
        cond: u128,
    ) {
        self.check_pe(pe);
        if target.offset % width.min(8) != 0 {
            self.fatal(ShmemError::Misaligned { addr: target, width });
        }
        let req = AtomicRequest {
            id,
            target,
            op,
            width: width as u8,
            value: value & width_mask(width),
            cond: cond & width_mask(width),
        };
        let payload = match bincode::serialize(&req) {
            Ok(payload) => payload,
            Err(e) => self.fatal(ShmemError::Payload(e.to_string())),
        };
        if let Err(e) = self.lamellae.send_am(pe, AmId::AtomicRequest, payload) {
            self.fatal(e.into());
        }
    }

    /// blocking remote atomic, returns the prior value once the update is visible at the target
    pub(crate) fn atomic_fetch_op(
        &self,
        pe: usize,
        target: SymAddr,
        op: AtomicOp,
        width: usize,
        value: u128,
        cond: u128,
    ) -> u128 {
        let reply = self.am.pending.register();
        self.atomic_request(pe, target, op, width, reply.id, value, cond);
        let old = reply.flag.wait(&self.waiter("a remote atomic"));
        old & width_mask(width)
    }

    /// posted remote atomic; completion is observed by quiet/fence
    pub(crate) fn atomic_post_op(
        &self,
        pe: usize,
        target: SymAddr,
        op: AtomicOp,
        width: usize,
        value: u128,
    ) {
        debug_assert!(op.is_posted(), "{:?} returns a value and cannot be posted", op);
        self.am.atomics.posted();
        self.atomic_request(pe, target, op, width, 0, value, 0);
    }
}

/// A type that can be the target of a remote atomic.
///
/// Implemented for the 32, 64 and 128 bit integers, `isize`/`usize`, and `f32`/`f64`.
pub trait AtomicValue: Copy + Send + Sync + 'static {
    /// byte width of the atomic operation (4, 8 or 16)
    const WIDTH: usize;
    fn to_bits(self) -> u128;
    fn from_bits(bits: u128) -> Self;
}

/// An [AtomicValue] that also supports the arithmetic and conditional operations.
pub trait AtomicArith: AtomicValue {}

macro_rules! atomic_int {
    ($($t:ty => $u:ty),*) => {
        $(
            impl AtomicValue for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();
                fn to_bits(self) -> u128 {
                    self as $u as u128
                }
                fn from_bits(bits: u128) -> Self {
                    bits as $u as $t
                }
            }
            impl AtomicArith for $t {}
        )*
    };
}

atomic_int!(
    i32 => u32,
    u32 => u32,
    i64 => u64,
    u64 => u64,
    isize => usize,
    usize => usize,
    i128 => u128,
    u128 => u128
);

impl AtomicValue for f32 {
    const WIDTH: usize = 4;
    fn to_bits(self) -> u128 {
        f32::to_bits(self) as u128
    }
    fn from_bits(bits: u128) -> Self {
        f32::from_bits(bits as u32)
    }
}

impl AtomicValue for f64 {
    const WIDTH: usize = 8;
    fn to_bits(self) -> u128 {
        f64::to_bits(self) as u128
    }
    fn from_bits(bits: u128) -> Self {
        f64::from_bits(bits as u64)
    }
}
