use crate::api::ShmemInterceptor;
use crate::env_var::{config, parse_size, SegmentExchange, WaitMode};
use crate::lamellae::local_lamellae::comm::{set_current, LocalFabric};
use crate::lamellae::Backend;
use crate::logging;
use crate::shmem_rt::{RtConfig, ShmemRT};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// The calling PE's view of an rshmem job.
///
/// Constructing a ShmemWorld (through [ShmemWorldBuilder]) is collective: every PE of the job must
/// build one, and the call returns once every PE's symmetric segments are registered and known to
/// everyone else. All one-sided, atomic, collective, lock and allocator operations are methods of
/// this handle.
///
/// The world is finalized either explicitly with [finalize][ShmemWorld::finalize] or when it is
/// dropped; both are collective. If the PE is unwinding from a panic when the world is dropped, the
/// whole job is aborted instead so that the other PEs do not wait forever.
pub struct ShmemWorld {
    pub(crate) rt: Arc<ShmemRT>,
    pub(crate) interceptor: Option<Arc<dyn ShmemInterceptor>>,
}

impl std::fmt::Debug for ShmemWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmemWorld({:?})", self.rt)
    }
}

impl ShmemWorld {
    /// Returns the id of this PE (roughly equivalent to MPI Rank)
    pub fn my_pe(&self) -> usize {
        self.rt.my_pe
    }

    /// Returns number of PE's in this job
    pub fn num_pes(&self) -> usize {
        self.rt.num_pes
    }

    /// size in bytes of this PE's symmetric heap
    pub fn heap_size(&self) -> usize {
        self.rt.heap_size()
    }

    /// bytes of the symmetric heap currently allocated
    pub fn heap_in_use(&self) -> usize {
        self.rt.heap_in_use()
    }

    /// names of the collective algorithms in use, in the order barrier, broadcast, collect, fcollect, alltoall
    pub fn algorithms(&self) -> [&'static str; 5] {
        self.rt.algorithms.names()
    }

    /// Collectively shut the world down: quiet, barrier, then release the symmetric segments.
    ///
    /// Any use of a symmetric object of this world after this point is an error.
    #[tracing::instrument(skip_all)]
    pub fn finalize(self) {
        // the work happens in drop
    }
}

impl Drop for ShmemWorld {
    #[tracing::instrument(skip_all)]
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.rt.abandon(&format!("pe {} panicked", self.rt.my_pe));
        } else {
            self.rt.finalize();
        }
    }
}

/// An implementation of the Builder design pattern, used to construct an instance of a ShmemWorld.
///
/// Every setting defaults to the value of the corresponding `RSHMEM_*` environment variable (see
/// [Config][crate::Config]); the builder methods override it for this world only.
///
/// # Examples
///
///```
/// use rshmem::{ShmemWorldBuilder, WaitMode};
///
/// let world = ShmemWorldBuilder::new()
///     .with_heap_size(1 << 20)
///     .with_wait_mode(WaitMode::Block)
///     .build();
/// assert_eq!(world.num_pes(), 1);
///```
pub struct ShmemWorldBuilder {
    backend: Backend,
    heap_size: Option<usize>,
    static_size: Option<usize>,
    wait_mode: Option<WaitMode>,
    segment_exchange: Option<SegmentExchange>,
    barrier_algorithm: Option<String>,
    broadcast_algorithm: Option<String>,
    collect_algorithm: Option<String>,
    fcollect_algorithm: Option<String>,
    alltoall_algorithm: Option<String>,
    symmetric_check: Option<bool>,
    lock_legacy_zero: Option<bool>,
    ping_timeout: Option<Duration>,
    interceptor: Option<Arc<dyn ShmemInterceptor>>,
}

impl std::fmt::Debug for ShmemWorldBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemWorldBuilder")
            .field("backend", &self.backend)
            .field("heap_size", &self.heap_size)
            .field("wait_mode", &self.wait_mode)
            .field("interceptor", &self.interceptor.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ShmemWorldBuilder {
    fn default() -> Self {
        ShmemWorldBuilder::new()
    }
}

impl ShmemWorldBuilder {
    /// Construct a new world builder
    pub fn new() -> ShmemWorldBuilder {
        ShmemWorldBuilder {
            backend: Default::default(),
            heap_size: None,
            static_size: None,
            wait_mode: None,
            segment_exchange: None,
            barrier_algorithm: None,
            broadcast_algorithm: None,
            collect_algorithm: None,
            fcollect_algorithm: None,
            alltoall_algorithm: None,
            symmetric_check: None,
            lock_legacy_zero: None,
            ping_timeout: None,
            interceptor: None,
        }
    }

    /// Specify the lamellae backend to use for this execution
    pub fn with_lamellae(mut self, backend: Backend) -> ShmemWorldBuilder {
        self.backend = backend;
        self
    }

    /// bytes of symmetric heap per PE, must be the same on every PE
    pub fn with_heap_size(mut self, bytes: usize) -> ShmemWorldBuilder {
        self.heap_size = Some(bytes);
        self
    }

    /// bytes available to [declare_static][crate::ShmemWorld::declare_static] per PE
    pub fn with_static_size(mut self, bytes: usize) -> ShmemWorldBuilder {
        self.static_size = Some(bytes);
        self
    }

    pub fn with_wait_mode(mut self, mode: WaitMode) -> ShmemWorldBuilder {
        self.wait_mode = Some(mode);
        self
    }

    pub fn with_segment_exchange(mut self, exchange: SegmentExchange) -> ShmemWorldBuilder {
        self.segment_exchange = Some(exchange);
        self
    }

    /// `linear`, `dissemination` or `transport`
    pub fn with_barrier_algorithm(mut self, name: &str) -> ShmemWorldBuilder {
        self.barrier_algorithm = Some(name.to_owned());
        self
    }

    /// `linear` or `tree`
    pub fn with_broadcast_algorithm(mut self, name: &str) -> ShmemWorldBuilder {
        self.broadcast_algorithm = Some(name.to_owned());
        self
    }

    /// `wavefront`
    pub fn with_collect_algorithm(mut self, name: &str) -> ShmemWorldBuilder {
        self.collect_algorithm = Some(name.to_owned());
        self
    }

    /// `linear` or `wavefront`
    pub fn with_fcollect_algorithm(mut self, name: &str) -> ShmemWorldBuilder {
        self.fcollect_algorithm = Some(name.to_owned());
        self
    }

    /// `direct` or `shifted`
    pub fn with_alltoall_algorithm(mut self, name: &str) -> ShmemWorldBuilder {
        self.alltoall_algorithm = Some(name.to_owned());
        self
    }

    /// broadcast and compare the size of every symmetric allocation (on by default in debug builds)
    pub fn with_symmetric_check(mut self, check: bool) -> ShmemWorldBuilder {
        self.symmetric_check = Some(check);
        self
    }

    /// treat an all zero lock word as a free lock
    pub fn with_lock_legacy_zero(mut self, normalize: bool) -> ShmemWorldBuilder {
        self.lock_legacy_zero = Some(normalize);
        self
    }

    /// deadline of [pe_accessible][crate::ShmemWorld::pe_accessible]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> ShmemWorldBuilder {
        self.ping_timeout = Some(timeout);
        self
    }

    /// install a hook invoked on entry and exit of every [ShmemWorld] operation
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ShmemInterceptor>) -> ShmemWorldBuilder {
        self.interceptor = Some(interceptor);
        self
    }

    fn rt_config(self) -> (RtConfig, Option<Arc<dyn ShmemInterceptor>>) {
        let env = config();
        let heap_size = self.heap_size.or_else(|| {
            env.symmetric_size.as_deref().and_then(|size| match parse_size(size) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("ignoring RSHMEM_SYMMETRIC_SIZE: {}", e);
                    None
                }
            })
        });
        let config = RtConfig {
            backend: self.backend,
            heap_size,
            static_size: self.static_size.unwrap_or(env.static_size),
            wait_mode: self.wait_mode.unwrap_or(env.wait_mode),
            segment_exchange: self.segment_exchange.unwrap_or(env.segment_exchange),
            barrier_algorithm: self
                .barrier_algorithm
                .unwrap_or_else(|| env.barrier_algorithm.clone()),
            broadcast_algorithm: self
                .broadcast_algorithm
                .unwrap_or_else(|| env.broadcast_algorithm.clone()),
            collect_algorithm: self
                .collect_algorithm
                .unwrap_or_else(|| env.collect_algorithm.clone()),
            fcollect_algorithm: self
                .fcollect_algorithm
                .unwrap_or_else(|| env.fcollect_algorithm.clone()),
            alltoall_algorithm: self
                .alltoall_algorithm
                .unwrap_or_else(|| env.alltoall_algorithm.clone()),
            symmetric_check: self
                .symmetric_check
                .or(env.symmetric_check)
                .unwrap_or(cfg!(debug_assertions)),
            lock_legacy_zero: self.lock_legacy_zero.unwrap_or(env.lock_legacy_zero),
            ping_timeout: self
                .ping_timeout
                .unwrap_or_else(|| Duration::from_secs_f64(env.ping_timeout.max(0.0))),
        };
        (config, self.interceptor)
    }

    /// Instantiate a ShmemWorld object (collective)
    #[tracing::instrument(skip_all)]
    pub fn build(self) -> ShmemWorld {
        if let Some(level) = &config().log_level {
            logging::init(level, config().log_file.as_deref());
        }
        let (config, interceptor) = self.rt_config();
        ShmemWorld {
            rt: ShmemRT::new(config),
            interceptor,
        }
    }
}

/// Run `f` as an in-process job of `num_pes` PEs, each on its own thread, and return their results
/// in PE order.
///
/// Inside `f`, [ShmemWorldBuilder::build] joins the job as the PE the thread was started for. If any
/// PE panics the job is aborted (every blocked PE unwinds) and the panic of the PE that failed first
/// is resumed on the calling thread.
///
/// # Examples
///
///```
/// use rshmem::ShmemWorldBuilder;
///
/// let pes = rshmem::launch(3, || {
///     let world = ShmemWorldBuilder::new().with_heap_size(1 << 16).build();
///     world.barrier_all();
///     world.my_pe()
/// });
/// assert_eq!(pes, vec![0, 1, 2]);
///```
pub fn launch<R, F>(num_pes: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn() -> R + Sync,
{
    assert!(num_pes > 0, "a job needs at least one pe");
    let fabric = Arc::new(LocalFabric::new(num_pes));
    let outcomes: Vec<std::thread::Result<R>> = std::thread::scope(|s| {
        let threads: Vec<_> = (0..num_pes)
            .map(|pe| {
                let fabric = fabric.clone();
                let f = &f;
                std::thread::Builder::new()
                    .name(format!("pe{}", pe))
                    .spawn_scoped(s, move || {
                        set_current(fabric.clone(), pe);
                        let res = panic::catch_unwind(AssertUnwindSafe(f));
                        if res.is_err() {
                            fabric.abort(pe, &format!("pe {} panicked", pe));
                        }
                        res
                    })
            })
            .collect();
        threads
            .into_iter()
            .enumerate()
            .map(|(pe, thread)| match thread {
                Ok(thread) => thread.join().and_then(|res| res),
                Err(e) => {
                    let msg = format!("unable to start pe {}: {}", pe, e);
                    fabric.abort(pe, &msg);
                    Err(Box::new(msg) as Box<dyn std::any::Any + Send>)
                }
            })
            .collect()
    });
    if outcomes.iter().any(|res| res.is_err()) {
        let origin = fabric.abort_origin().unwrap_or(0);
        let mut panics: Vec<_> = outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(pe, res)| res.err().map(|payload| (pe, payload)))
            .collect();
        let first = panics.iter().position(|(pe, _)| *pe == origin).unwrap_or(0);
        let (_, payload) = panics.swap_remove(first);
        panic::resume_unwind(payload);
    }
    outcomes.into_iter().flatten().collect()
}
