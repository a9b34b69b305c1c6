use super::comm::LocalFabric;
use super::mem;
use super::Local;
use crate::lamellae::error::{AmError, AmResult};
use crate::lamellae::{AmHandler, AmId, Lamellae, LamellaeAM};
use crate::progress::{CompletionFlag, WaitMode};
use crate::symmetric::SymAddr;

use crossbeam::channel::{Receiver, TryRecvError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

const SERVICE_SPINS: usize = 2048;

/// Work queued on a pe's service thread.
pub(crate) enum Command {
    Am {
        src: usize,
        id: AmId,
        payload: Vec<u8>,
    },
    Put {
        pe: usize,
        dst: SymAddr,
        data: Vec<u8>,
        done: Option<Arc<CompletionFlag>>,
    },
    Get {
        pe: usize,
        src: SymAddr,
        len: usize,
        dst: SymAddr,
        done: Option<Arc<CompletionFlag>>,
    },
    Shutdown,
}

impl LamellaeAM for Local {
    fn send_am(&self, pe: usize, id: AmId, payload: Vec<u8>) -> AmResult<()> {
        if pe >= self.fabric.num_pes() {
            return Err(AmError::PeOutOfRange {
                pe,
                num_pes: self.fabric.num_pes(),
            });
        }
        trace!("am {:?} {} -> {} ({} bytes)", id, self.my_pe, pe, payload.len());
        let inbox = self.fabric.inbox(pe).ok_or(AmError::NotListening(pe))?;
        inbox
            .send(Command::Am {
                src: self.my_pe,
                id,
                payload,
            })
            .map_err(|_| AmError::NotListening(pe))
    }
}

fn recv(rx: &Receiver<Command>, wait_mode: WaitMode) -> Option<Command> {
    match wait_mode {
        WaitMode::Block => rx.recv().ok(),
        WaitMode::Spin => loop {
            match rx.try_recv() {
                Ok(cmd) => return Some(cmd),
                Err(TryRecvError::Empty) => std::hint::spin_loop(),
                Err(TryRecvError::Disconnected) => return None,
            }
        },
        WaitMode::SpinBlock => {
            for _ in 0..SERVICE_SPINS {
                match rx.try_recv() {
                    Ok(cmd) => return Some(cmd),
                    Err(TryRecvError::Empty) => std::hint::spin_loop(),
                    Err(TryRecvError::Disconnected) => return None,
                }
            }
            rx.recv().ok()
        }
    }
}

/// Body of a pe's service thread: executes inbound active messages and the pe's own nonblocking transfers.
pub(crate) fn service(
    my_pe: usize,
    lamellae: Weak<Lamellae>,
    fabric: Arc<LocalFabric>,
    outstanding: Arc<AtomicUsize>,
    rx: Receiver<Command>,
    wait_mode: WaitMode,
    handler: Arc<dyn AmHandler>,
) {
    while let Some(cmd) = recv(&rx, wait_mode) {
        let Some(lamellae) = lamellae.upgrade() else {
            break;
        };
        match cmd {
            Command::Shutdown => break,
            Command::Am { src, id, payload } => {
                match handler.exec(&lamellae, src, id, &payload) {
                    Ok(Some((reply_id, reply))) => {
                        match lamellae.send_am(src, reply_id, reply) {
                            Ok(()) => {}
                            // the requester already shut down, nobody is left waiting on this reply
                            Err(AmError::NotListening(_)) => {
                                debug!(
                                    "pe {} dropped {:?} for pe {}, it stopped listening",
                                    my_pe, reply_id, src
                                );
                            }
                            Err(e) => {
                                if !fabric.is_aborted() {
                                    error!(
                                        "pe {} unable to reply {:?} to pe {}: {}",
                                        my_pe, reply_id, src, e
                                    );
                                }
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("pe {} failed to execute {:?} from pe {}: {}", my_pe, id, src, e);
                        fabric.abort(my_pe, &e.to_string());
                    }
                }
            }
            Command::Put { pe, dst, data, done } => {
                let res = fabric
                    .segment(pe, dst.segment)
                    .and_then(|seg| seg.range(dst.offset, data.len()));
                match res {
                    Some(ptr) => unsafe { mem::copy_in(ptr, &data) },
                    None => {
                        error!(
                            "pe {} nonblocking put to {:?} on pe {} is out of bounds",
                            my_pe, dst, pe
                        );
                        fabric.abort(my_pe, "nonblocking put out of bounds");
                    }
                }
                finish(&outstanding, done);
            }
            Command::Get { pe, src, len, dst, done } => {
                let from = fabric
                    .segment(pe, src.segment)
                    .and_then(|seg| seg.range(src.offset, len));
                let to = fabric
                    .segment(my_pe, dst.segment)
                    .and_then(|seg| seg.range(dst.offset, len));
                match (from, to) {
                    (Some(from), Some(to)) => {
                        let mut buf = vec![0u8; len];
                        unsafe {
                            mem::copy_out(from, &mut buf);
                            mem::copy_in(to, &buf);
                        }
                    }
                    _ => {
                        error!(
                            "pe {} nonblocking get of {:?} from pe {} is out of bounds",
                            my_pe, src, pe
                        );
                        fabric.abort(my_pe, "nonblocking get out of bounds");
                    }
                }
                finish(&outstanding, done);
            }
        }
    }
    trace!("pe {} service thread exiting", my_pe);
}

/// the handle is completed first so a finished quiet implies finished handles
fn finish(outstanding: &AtomicUsize, done: Option<Arc<CompletionFlag>>) {
    if let Some(done) = done {
        done.complete(0);
    }
    outstanding.fetch_sub(1, Ordering::AcqRel);
}
