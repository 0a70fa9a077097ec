//! Wire protocol for process-isolated workers.
//!
//! Parent and child exchange line-delimited JSON over the child's stdio: one
//! request line per frame, one reply line per request, strictly in lockstep.
//! The payload crosses the process boundary through serde, so process-substrate
//! pipelines require `P: Serialize + DeserializeOwned`.
//!
//! Replies echo the request sequence number; a failed transform comes back as
//! an explicit `failed` reply rather than a dropped line, mirroring the
//! failure-marker contract of the in-process queues.

use std::io::{BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::capability::transform::FrameTransform;
use crate::foundation::error::{FramepipeError, FramepipeResult};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum WireWork<P> {
    Frame { seq: u64, payload: P },
    End,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum WireResult<P> {
    Done { seq: u64, payload: P },
    Failed { seq: u64, error: String },
}

pub(crate) fn write_message<T: Serialize>(
    output: &mut impl Write,
    msg: &T,
) -> FramepipeResult<()> {
    serde_json::to_writer(&mut *output, msg)
        .map_err(|e| FramepipeError::serde(format!("encode wire message: {e}")))?;
    output
        .write_all(b"\n")
        .and_then(|()| output.flush())
        .map_err(|e| FramepipeError::pipeline(format!("worker pipe write failed: {e}")))?;
    Ok(())
}

/// Read one message; `Ok(None)` on a cleanly closed pipe.
pub(crate) fn read_message<T: DeserializeOwned>(
    input: &mut impl BufRead,
) -> FramepipeResult<Option<T>> {
    let mut line = String::new();
    let read = input
        .read_line(&mut line)
        .map_err(|e| FramepipeError::pipeline(format!("worker pipe read failed: {e}")))?;
    if read == 0 {
        return Ok(None);
    }
    let msg = serde_json::from_str(line.trim_end())
        .map_err(|e| FramepipeError::serde(format!("decode wire message: {e}")))?;
    Ok(Some(msg))
}

/// Child-side worker loop for the process substrate.
///
/// A worker executable calls this with its transform and locked stdio; the
/// parent pipeline drives it via [`Pipeline::run_process`](crate::Pipeline::run_process).
/// The loop exits on the end sentinel or when the parent closes the pipe.
pub fn run_worker_stdio<P, T>(
    mut transform: T,
    mut input: impl BufRead,
    mut output: impl Write,
) -> FramepipeResult<()>
where
    P: Serialize + DeserializeOwned,
    T: FrameTransform<P>,
{
    loop {
        let Some(msg) = read_message::<WireWork<P>>(&mut input)? else {
            break;
        };
        match msg {
            WireWork::Frame { seq, payload } => {
                let reply = match transform.apply(payload) {
                    Ok(out) => WireResult::Done { seq, payload: out },
                    Err(e) => WireResult::Failed {
                        seq,
                        error: e.to_string(),
                    },
                };
                write_message(&mut output, &reply)?;
            }
            WireWork::End => break,
        }
    }
    Ok(())
}
