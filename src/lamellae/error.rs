use crate::error::ShmemError;
use crate::symmetric::{SegmentId, SymAddr};

#[derive(Debug, Clone)]
pub(crate) enum RdmaError {
    PeOutOfRange { pe: usize, num_pes: usize },
    NoSegment { pe: usize, segment: SegmentId },
    OutOfBounds { pe: usize, addr: SymAddr, len: usize },
}

pub(crate) type RdmaResult<T> = Result<T, RdmaError>;

impl std::fmt::Display for RdmaError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RdmaError::PeOutOfRange { pe, num_pes } => {
                write!(f, "rdma to pe {} but the fabric only has {} pes", pe, num_pes)
            }
            RdmaError::NoSegment { pe, segment } => {
                write!(f, "pe {} has not registered its {:?} segment", pe, segment)
            }
            RdmaError::OutOfBounds { pe, addr, len } => {
                write!(f, "rdma of {} bytes at {:?} on pe {} is out of bounds", len, addr, pe)
            }
        }
    }
}

impl std::error::Error for RdmaError {}

impl From<RdmaError> for ShmemError {
    fn from(err: RdmaError) -> ShmemError {
        match err {
            RdmaError::PeOutOfRange { pe, num_pes } => ShmemError::PeOutOfRange { pe, num_pes },
            RdmaError::NoSegment { pe, segment } => ShmemError::OutOfSegment {
                pe,
                addr: SymAddr::new(segment, 0),
                len: 0,
            },
            RdmaError::OutOfBounds { pe, addr, len } => ShmemError::OutOfSegment { pe, addr, len },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum AmError {
    PeOutOfRange { pe: usize, num_pes: usize },
    NotListening(usize),
}

pub(crate) type AmResult<T> = Result<T, AmError>;

impl std::fmt::Display for AmError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AmError::PeOutOfRange { pe, num_pes } => {
                write!(f, "active message to pe {} but the fabric only has {} pes", pe, num_pes)
            }
            AmError::NotListening(pe) => write!(f, "pe {} is not servicing active messages", pe),
        }
    }
}

impl std::error::Error for AmError {}

impl From<AmError> for ShmemError {
    fn from(err: AmError) -> ShmemError {
        match err {
            AmError::PeOutOfRange { pe, num_pes } => ShmemError::PeOutOfRange { pe, num_pes },
            AmError::NotListening(pe) => ShmemError::Undeliverable {
                pe,
                reason: err.to_string(),
            },
        }
    }
}
