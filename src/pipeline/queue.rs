//! Queue message types and the polling send/recv helpers shared by all stages.
//!
//! Both pipeline queues are bounded MPMC channels. No stage ever blocks on one
//! indefinitely: every wait is a short timeout followed by a cancel check, so a
//! cancelled pipeline unwinds within one poll interval even when a queue is
//! full or empty.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::foundation::core::FrameIndex;
use crate::pipeline::cancel::CancelToken;

/// Dispatch-queue element: a numbered frame, or the per-worker end sentinel.
#[derive(Debug)]
pub(crate) enum WorkMsg<P> {
    Frame(FrameIndex, P),
    /// End-of-stream sentinel. One is enqueued per worker; a worker exits on
    /// its first sentinel without forwarding it.
    End,
}

/// Result-queue element.
#[derive(Debug)]
pub(crate) enum ResultMsg<P> {
    Done(FrameIndex, P),
    /// Failure marker carrying the original index, so the in-order drain can
    /// skip the frame instead of waiting for it forever.
    Failed(FrameIndex, String),
    /// Per-worker completion token; the drain finishes once it has one per
    /// worker and an empty reorder buffer.
    WorkerExit,
}

/// Outcome of a single polling receive.
pub(crate) enum PollRecv<T> {
    Msg(T),
    /// Timed out; the caller re-checks the cancel token and polls again.
    Idle,
    /// All senders are gone.
    Closed,
}

pub(crate) fn recv_polling<T>(rx: &Receiver<T>, poll: Duration) -> PollRecv<T> {
    match rx.recv_timeout(poll) {
        Ok(msg) => PollRecv::Msg(msg),
        Err(RecvTimeoutError::Timeout) => PollRecv::Idle,
        Err(RecvTimeoutError::Disconnected) => PollRecv::Closed,
    }
}

/// Send with the polling contract: retry on a full queue until delivered,
/// giving up (and dropping `msg`) once the pipeline is cancelled or the
/// receivers are gone. Returns whether the message was delivered.
pub(crate) fn send_polling<T>(
    tx: &Sender<T>,
    msg: T,
    poll: Duration,
    cancel: &CancelToken,
) -> bool {
    let mut pending = msg;
    loop {
        match tx.send_timeout(pending, poll) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(again)) => {
                if cancel.is_canceled() {
                    return false;
                }
                pending = again;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
