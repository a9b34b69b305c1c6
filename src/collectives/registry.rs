//! Name to implementation tables for the pluggable collectives.
//!
//! The algorithm of each collective kind is looked up once, when the runtime is built, from the
//! `RSHMEM_*_ALGORITHM` variables (or the builder overrides). An unknown name is reported with a
//! warning and the documented default is used instead.
use super::{alltoall, barrier, broadcast, collect};
use crate::shmem_arch::ActiveSet;
use crate::shmem_rt::{RtConfig, ShmemRT};
use crate::symmetric::{SymAddr, SymmetricPtr};

use lazy_static::lazy_static;
use std::collections::HashMap;
use tracing::warn;

/// (rt, set, my index in set, pSync)
pub(crate) type BarrierFn = fn(&ShmemRT, &ActiveSet, usize, SymmetricPtr<i64>);
/// (rt, dest, src, bytes, root index, set, my index, pSync)
pub(crate) type BroadcastFn =
    fn(&ShmemRT, SymAddr, SymAddr, usize, usize, &ActiveSet, usize, SymmetricPtr<i64>);
/// (rt, dest, src, bytes contributed by me, set, my index, pSync); shared by collect, fcollect and alltoall
pub(crate) type GatherFn =
    fn(&ShmemRT, SymAddr, SymAddr, usize, &ActiveSet, usize, SymmetricPtr<i64>);

pub(crate) const DEFAULT_BARRIER: &str = "linear";
pub(crate) const DEFAULT_BROADCAST: &str = "tree";
pub(crate) const DEFAULT_COLLECT: &str = "wavefront";
pub(crate) const DEFAULT_FCOLLECT: &str = "linear";
pub(crate) const DEFAULT_ALLTOALL: &str = "direct";

lazy_static! {
    static ref BARRIERS: HashMap<&'static str, BarrierFn> = {
        let mut m: HashMap<&'static str, BarrierFn> = HashMap::new();
        m.insert("linear", barrier::linear);
        m.insert("dissemination", barrier::dissemination);
        m.insert("transport", barrier::transport);
        m
    };
    static ref BROADCASTS: HashMap<&'static str, BroadcastFn> = {
        let mut m: HashMap<&'static str, BroadcastFn> = HashMap::new();
        m.insert("linear", broadcast::linear);
        m.insert("tree", broadcast::tree);
        m
    };
    static ref COLLECTS: HashMap<&'static str, GatherFn> = {
        let mut m: HashMap<&'static str, GatherFn> = HashMap::new();
        m.insert("wavefront", collect::wavefront);
        m
    };
    static ref FCOLLECTS: HashMap<&'static str, GatherFn> = {
        let mut m: HashMap<&'static str, GatherFn> = HashMap::new();
        m.insert("linear", collect::fcollect_linear);
        m.insert("wavefront", collect::wavefront);
        m
    };
    static ref ALLTOALLS: HashMap<&'static str, GatherFn> = {
        let mut m: HashMap<&'static str, GatherFn> = HashMap::new();
        m.insert("direct", alltoall::direct);
        m.insert("shifted", alltoall::shifted);
        m
    };
}

fn lookup<F: Copy>(
    kind: &str,
    table: &HashMap<&'static str, F>,
    name: &str,
    default: &'static str,
) -> (&'static str, F) {
    let name = name.trim().to_lowercase();
    if let Some((key, f)) = table.get_key_value(name.as_str()) {
        return (*key, *f);
    }
    warn!(
        "unknown {} algorithm {:?}, using {:?} (choices: {:?})",
        kind,
        name,
        default,
        table.keys().collect::<Vec<_>>()
    );
    (default, table[default])
}

/// The algorithm chosen for each collective kind, with its name.
#[derive(Clone, Copy)]
pub(crate) struct Algorithms {
    pub(crate) barrier: (&'static str, BarrierFn),
    pub(crate) broadcast: (&'static str, BroadcastFn),
    pub(crate) collect: (&'static str, GatherFn),
    pub(crate) fcollect: (&'static str, GatherFn),
    pub(crate) alltoall: (&'static str, GatherFn),
}

impl std::fmt::Debug for Algorithms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Algorithms")
            .field("barrier", &self.barrier.0)
            .field("broadcast", &self.broadcast.0)
            .field("collect", &self.collect.0)
            .field("fcollect", &self.fcollect.0)
            .field("alltoall", &self.alltoall.0)
            .finish()
    }
}

impl Algorithms {
    pub(crate) fn select(config: &RtConfig) -> Algorithms {
        Algorithms {
            barrier: lookup("barrier", &BARRIERS, &config.barrier_algorithm, DEFAULT_BARRIER),
            broadcast: lookup(
                "broadcast",
                &BROADCASTS,
                &config.broadcast_algorithm,
                DEFAULT_BROADCAST,
            ),
            collect: lookup("collect", &COLLECTS, &config.collect_algorithm, DEFAULT_COLLECT),
            fcollect: lookup(
                "fcollect",
                &FCOLLECTS,
                &config.fcollect_algorithm,
                DEFAULT_FCOLLECT,
            ),
            alltoall: lookup(
                "alltoall",
                &ALLTOALLS,
                &config.alltoall_algorithm,
                DEFAULT_ALLTOALL,
            ),
        }
    }

    /// names of the selected algorithms, in the order barrier, broadcast, collect, fcollect, alltoall
    pub(crate) fn names(&self) -> [&'static str; 5] {
        [
            self.barrier.0,
            self.broadcast.0,
            self.collect.0,
            self.fcollect.0,
            self.alltoall.0,
        ]
    }
}
