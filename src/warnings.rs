use crate::config;

pub(crate) enum RuntimeWarning<'a> {
    DroppedHandle(&'a str),
    WaitTimeout(&'a str, f64),
}

impl<'a> RuntimeWarning<'a> {
    fn print_warning(&self) -> bool {
        match self {
            RuntimeWarning::DroppedHandle(_) => config().dropped_handle_warning.unwrap_or(true),
            RuntimeWarning::WaitTimeout(_, elapsed) => {
                config().deadlock_timeout > 0.0 && *elapsed > config().deadlock_timeout
            }
        }
    }

    #[cfg(feature = "runtime-warnings-panic")]
    fn panic(&self, msg: &str) {
        match self {
            RuntimeWarning::WaitTimeout(_, _) => {}
            _ => panic!("{msg}
                Note this warning causes a panic because you have compiled rshmem with the `runtime-warnings-panic` feature.
                Recompile without this feature to only print warnings, rather than panic.
                To view backtrace set RUST_LIB_BACKTRACE=1.
                {}",
                std::backtrace::Backtrace::capture()),
        }
    }

    pub(crate) fn print(self) {
        #[cfg(not(feature = "disable-runtime-warnings"))]
        if self.print_warning() {
            let msg = match self {
                RuntimeWarning::DroppedHandle(msg) => {
                    format!("[RSHMEM WARNING] You are dropping {msg} that has not been waited on.
                    The transfer still completes, but only quiet() or fence() will tell you when. Set RSHMEM_DROPPED_HANDLE_WARNING=false to disable this warning.")
                }
                RuntimeWarning::WaitTimeout(what, _) => {
                    format!("[RSHMEM WARNING][{:?}] {what} has been blocked for longer than the deadlock timeout. Potential deadlock detected.
                    Collectives (barrier, broadcast, collect, alltoall, reductions, symmetric allocation) require every PE of the active set to make the call.
                    The deadlock timeout can be set via the RSHMEM_DEADLOCK_TIMEOUT environment variable, the current timeout is {} seconds, setting this to 0 will disable this warning.",
                        std::thread::current().name().unwrap_or("unnamed"), config().deadlock_timeout)
                }
            };

            #[cfg(feature = "runtime-warnings-panic")]
            self.panic(&msg);
            tracing::warn!("{msg}");
        }
    }
}
