//! Error types surfaced by the runtime.
//!
//! Errors fall into three classes:
//! - [ShmemError] is fatal. Once an operation is in flight there is no way to roll it back, so the runtime
//!   logs the error, marks the whole job as aborted and panics.
//! - [MallocError] is reported. Symmetric allocator calls return it and also record it in the world's
//!   last-error cell, see [ShmemWorld::malloc_error][crate::ShmemWorld::malloc_error].
//! - the reachability probe never raises, it simply returns `false`.
use crate::symmetric::SymAddr;

/// A fatal runtime error.
#[derive(Debug, Clone)]
pub enum ShmemError {
    /// the transport could not be brought up
    TransportInit(String),
    /// an internal protocol payload could not be encoded or decoded
    Payload(String),
    /// an active message or transfer could not be delivered to `pe`
    Undeliverable { pe: usize, reason: String },
    /// the pe id is not part of the job
    PeOutOfRange { pe: usize, num_pes: usize },
    /// the descriptor does not resolve to memory inside a segment of `pe`
    OutOfSegment { pe: usize, addr: SymAddr, len: usize },
    /// an atomic target is not aligned to the width of the operation
    Misaligned { addr: SymAddr, width: usize },
    /// the calling pe is not a member of the active set passed to a collective
    NotInActiveSet { pe: usize },
    /// the active set describes pes outside of the job
    BadActiveSet { start: usize, log_stride: usize, size: usize },
    /// a pSync array is shorter than the collective requires
    SyncArrayTooSmall { needed: usize, len: usize },
    /// pes registered segments of different sizes
    SegmentMismatch { pe: usize, size: usize, expected: usize },
    /// the world has already been finalized
    Finalized,
    /// another pe hit a fatal error and the job is going down
    Aborted { pe: usize, msg: String },
}

impl std::fmt::Display for ShmemError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ShmemError::TransportInit(msg) => write!(f, "transport initialization failed: {}", msg),
            ShmemError::Payload(msg) => write!(f, "protocol payload error: {}", msg),
            ShmemError::Undeliverable { pe, reason } => {
                write!(f, "unable to deliver message to pe {}: {}", pe, reason)
            }
            ShmemError::PeOutOfRange { pe, num_pes } => {
                write!(f, "pe {} is out of range, the job has {} pes", pe, num_pes)
            }
            ShmemError::OutOfSegment { pe, addr, len } => write!(
                f,
                "{:?} (+{} bytes) does not lie within a symmetric segment of pe {}",
                addr, len, pe
            ),
            ShmemError::Misaligned { addr, width } => {
                write!(f, "{:?} is not aligned for a {} byte atomic", addr, width)
            }
            ShmemError::NotInActiveSet { pe } => {
                write!(f, "pe {} called a collective on an active set it is not part of", pe)
            }
            ShmemError::BadActiveSet {
                start,
                log_stride,
                size,
            } => write!(
                f,
                "active set (start {}, log stride {}, size {}) exceeds the job",
                start, log_stride, size
            ),
            ShmemError::SyncArrayTooSmall { needed, len } => {
                write!(f, "pSync has {} elements but {} are required", len, needed)
            }
            ShmemError::SegmentMismatch { pe, size, expected } => write!(
                f,
                "pe {} registered a segment of {} bytes, expected {}",
                pe, size, expected
            ),
            ShmemError::Finalized => write!(f, "the world has been finalized"),
            ShmemError::Aborted { pe, msg } => write!(f, "job aborted by pe {}: {}", pe, msg),
        }
    }
}

impl std::error::Error for ShmemError {}

/// Status codes of the symmetric allocator.
///
/// The numeric values are stable and follow the classic SMA error numbering.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MallocStatus {
    Ok = 0,
    Fail = 1,
    AlreadyFree = 2,
    MemalignFailed = 3,
    ReallocFailed = 4,
    SymmsizeFailed = 5,
    BadSize = 6,
    NotAligned = 7,
    NotInSymmHeap = 8,
}

impl MallocStatus {
    pub(crate) fn from_u8(code: u8) -> MallocStatus {
        match code {
            0 => MallocStatus::Ok,
            1 => MallocStatus::Fail,
            2 => MallocStatus::AlreadyFree,
            3 => MallocStatus::MemalignFailed,
            4 => MallocStatus::ReallocFailed,
            5 => MallocStatus::SymmsizeFailed,
            6 => MallocStatus::BadSize,
            7 => MallocStatus::NotAligned,
            _ => MallocStatus::NotInSymmHeap,
        }
    }

    /// The numeric code of this status
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Human readable description of the status
    pub fn message(&self) -> &'static str {
        match self {
            MallocStatus::Ok => "no symmetric memory allocation error",
            MallocStatus::Fail => "symmetric memory allocation failed",
            MallocStatus::AlreadyFree => "attempt to free an already free symmetric block",
            MallocStatus::MemalignFailed => "aligned symmetric memory allocation failed",
            MallocStatus::ReallocFailed => "symmetric memory reallocation failed",
            MallocStatus::SymmsizeFailed => {
                "symmetric allocation size differs across the participating pes"
            }
            MallocStatus::BadSize => "requested symmetric allocation size is invalid",
            MallocStatus::NotAligned => "requested alignment is not a power of two",
            MallocStatus::NotInSymmHeap => "address is not inside the symmetric heap",
        }
    }
}

impl std::fmt::Display for MallocStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// An allocator failure, carrying the same code that is stored in the last-error cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MallocError(pub MallocStatus);

impl MallocError {
    pub fn status(&self) -> MallocStatus {
        self.0
    }
}

impl std::fmt::Display for MallocError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} (code {})", self.0.message(), self.0.code())
    }
}

impl std::error::Error for MallocError {}

/// A Result type for symmetric allocator operations
pub type MallocResult<T> = Result<T, MallocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for code in 0..=8u8 {
            assert_eq!(MallocStatus::from_u8(code).code(), code);
        }
    }

    #[test]
    fn every_status_has_a_distinct_message() {
        let msgs = (0..=8u8)
            .map(|c| MallocStatus::from_u8(c).message())
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(msgs.len(), 9);
    }
}
