//! Installation of the process wide `tracing` subscriber.
//!
//! The runtime only emits events; nothing is printed unless a subscriber is installed, either by the
//! application or by [init] (which [ShmemWorldBuilder::build][crate::ShmemWorldBuilder::build] calls when
//! `RSHMEM_LOG_LEVEL` is set). Every PE of an in-process job shares one subscriber, so lines carry the
//! thread name (`pe<N>` / `pe<N>-svc`) to tell them apart.
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a subscriber filtered by `level` (any `EnvFilter` directive), writing to `path` or stderr.
///
/// Returns false if a global subscriber was already installed (e.g. by another PE of the same
/// process, or by the application itself).
pub fn init(level: &str, path: Option<&str>) -> bool {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);
    match path {
        Some(path) => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("[RSHMEM] unable to open log file {path}: {e}, logging to stderr");
                    return init(level, None);
                }
            };
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.with_writer(Mutex::new(file)))
                .try_init()
                .is_ok()
        }
        None => tracing_subscriber::registry()
            .with(filter)
            .with(layer.with_writer(std::io::stderr))
            .try_init()
            .is_ok(),
    }
}
