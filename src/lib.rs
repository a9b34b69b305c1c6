//! rshmem is an OpenSHMEM style partitioned global address space library.
//!
//! A job is a fixed set of processing elements (PEs), numbered `0..num_pes`. Every PE owns two
//! symmetric segments: a heap, handed out collectively by [malloc][ShmemWorld::malloc] and friends so
//! that the same [SymmetricPtr] names the "same" object on every PE, and a static segment holding
//! variables declared with [declare_static][ShmemWorld::declare_static]. On top of that rshmem provides:
//! - one sided puts and gets, blocking, strided and nonblocking ([RdmaHandle])
//! - remote atomics (swap, compare-and-swap, fetch-add, ...) on 32, 64 and 128 bit cells
//! - point to point synchronization ([wait_until][ShmemWorld::wait_until]), fences and quiet
//! - collectives over an [ActiveSet]: barrier, broadcast, collect, fcollect, alltoall(s) and reductions
//! - distributed queue locks ([ShmemLock])
//!
//! rshmem relies on network providers called Lamellae to move data between PEs. Currently the "local"
//! lamellae is provided, running every PE as a thread of a single process (see [launch]).
//!
//! EXAMPLES
//! --------
//!
//! # Building a world and exchanging data
//! ```
//! use rshmem::{ActiveSet, ShmemWorldBuilder, BARRIER_SYNC_SIZE};
//!
//! let results = rshmem::launch(4, || {
//!     let world = ShmemWorldBuilder::new().with_heap_size(1 << 20).build();
//!     let me = world.my_pe();
//!     let n = world.num_pes();
//!     let slots = world.malloc::<u64>(n).unwrap();
//!     // every pe writes its id into its own slot on the next pe
//!     world.put(slots.sub(me, 1), &[me as u64], (me + 1) % n);
//!     world.barrier_all();
//!     let prev = world.g(slots.sub((me + n - 1) % n, 1), me);
//!
//!     let psync = world.alloc_psync(BARRIER_SYNC_SIZE).unwrap();
//!     world.barrier(ActiveSet::world(n), psync);
//!     prev
//! });
//! assert_eq!(results, vec![3, 0, 1, 2]);
//! ```
//!
//! # Configuration
//! Defaults come from `RSHMEM_*` environment variables (see [Config]); anything set on the
//! [ShmemWorldBuilder] takes precedence.

mod api;
mod atomic;
mod collectives;
mod env_var;
mod error;
mod handles;
mod lamellae;
mod lock;
pub mod logging;
mod progress;
mod shmem_alloc;
mod shmem_arch;
mod shmem_rt;
mod shmem_world;
mod symmetric;
mod utils;
mod warnings;

pub use crate::api::{Remote, ShmemInterceptor};
pub use crate::atomic::{AtomicArith, AtomicValue};
pub use crate::collectives::{
    ALLTOALL_SYNC_SIZE, BARRIER_SYNC_SIZE, BCAST_SYNC_SIZE, COLLECT_SYNC_SIZE, REDUCE_SYNC_SIZE,
    SYNC_VALUE,
};
pub use crate::env_var::{config, parse_size, Config, SegmentExchange, SizeParseError, WaitMode};
pub use crate::error::{MallocError, MallocResult, MallocStatus, ShmemError};
pub use crate::handles::RdmaHandle;
pub use crate::lamellae::Backend;
pub use crate::lock::ShmemLock;
pub use crate::progress::Comparator;
pub use crate::shmem_arch::{ActiveSet, ActiveSetIter, IdError};
pub use crate::shmem_world::{launch, ShmemWorld, ShmemWorldBuilder};
pub use crate::symmetric::{SegmentId, SymAddr, SymmetricPtr};
