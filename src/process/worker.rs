//! Parent-side process substrate: spawning worker children and speaking the
//! wire protocol to them.
//!
//! The scheduling algorithm is identical to the threaded substrate: the same
//! queues, sentinels, credits and polling contract. Only the transform seam
//! differs. Each worker thread forwards its frames to a private child process
//! instead of computing in-process, so the transform runs in an isolated
//! failure domain and the payload crosses a serialization boundary.

use std::ffi::OsString;
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::capability::sink::FrameSink;
use crate::capability::source::FrameSource;
use crate::capability::transform::FrameTransform;
use crate::foundation::error::{FramepipeError, FramepipeResult};
use crate::pipeline::session::{Pipeline, PipelineStats};
use crate::process::wire::{WireResult, WireWork, read_message, write_message};

/// How to launch one worker child for [`Pipeline::run_process`].
///
/// The program must read requests from stdin and write replies to stdout
/// (normally by calling [`run_worker_stdio`](crate::run_worker_stdio)) and must
/// exit once stdin closes. Its stderr is inherited so worker logs stay visible.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    /// Launch `program` as the worker executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Launch the currently running executable as the worker, the usual
    /// arrangement with a dedicated worker subcommand on the binary.
    pub fn current_exe() -> FramepipeResult<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            FramepipeError::pipeline(format!("cannot resolve current executable: {e}"))
        })?;
        Ok(Self::new(exe))
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

/// A [`FrameTransform`] that delegates each frame to a private worker child
/// over the stdio wire protocol, one request in flight at a time.
///
/// A dead or misbehaving child surfaces as per-frame transform errors, so the
/// pipeline skips the affected frames and keeps running on the remaining
/// workers. Dropping the value sends the end sentinel, closes the pipe and
/// reaps the child.
#[derive(Debug)]
pub struct ProcessTransform<P> {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    seq: u64,
    _payload: PhantomData<fn(P) -> P>,
}

impl<P> ProcessTransform<P>
where
    P: Serialize + DeserializeOwned,
{
    /// Spawn one worker child.
    pub fn spawn(worker: &WorkerCommand) -> FramepipeResult<Self> {
        let mut child = worker.command().spawn().map_err(|e| {
            FramepipeError::pipeline(format!(
                "failed to spawn worker process '{}': {e}",
                worker.program.display()
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FramepipeError::pipeline("failed to open worker stdin (unexpected)"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FramepipeError::pipeline("failed to open worker stdout (unexpected)"))?;
        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stdout: BufReader::new(stdout),
            seq: 0,
            _payload: PhantomData,
        })
    }
}

impl<P> FrameTransform<P> for ProcessTransform<P>
where
    P: Serialize + DeserializeOwned + Send,
{
    fn apply(&mut self, frame: P) -> FramepipeResult<P> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(FramepipeError::transform("worker process already shut down"));
        };
        let seq = self.seq;
        self.seq += 1;

        write_message(stdin, &WireWork::Frame { seq, payload: frame })
            .map_err(|e| FramepipeError::transform(format!("worker request failed: {e}")))?;
        let reply = read_message::<WireResult<P>>(&mut self.stdout)
            .map_err(|e| FramepipeError::transform(format!("worker reply failed: {e}")))?
            .ok_or_else(|| FramepipeError::transform("worker process closed its pipe"))?;

        match reply {
            WireResult::Done { seq: got, payload } if got == seq => Ok(payload),
            WireResult::Failed { seq: got, error } if got == seq => {
                Err(FramepipeError::transform(error))
            }
            WireResult::Done { seq: got, .. } | WireResult::Failed { seq: got, .. } => {
                Err(FramepipeError::transform(format!(
                    "worker reply out of sequence: expected {seq}, got {got}"
                )))
            }
        }
    }
}

impl<P> Drop for ProcessTransform<P> {
    fn drop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = write_message(&mut stdin, &WireWork::<()>::End);
            let _ = stdin.flush();
            // Dropping stdin closes the pipe; the child exits on the sentinel
            // or on EOF, whichever it sees first.
        }
        let _ = self.child.wait();
    }
}

impl Pipeline {
    /// Run the pipeline with process-isolated workers.
    ///
    /// One child is spawned per worker slot from `worker` before the source is
    /// opened; a spawn failure aborts the run. Everything else matches
    /// [`Pipeline::run`], with the payload serialized across the pipe in both
    /// directions.
    pub fn run_process<P>(
        &self,
        source: &mut dyn FrameSource<P>,
        worker: &WorkerCommand,
        sink: &mut dyn FrameSink<P>,
    ) -> FramepipeResult<PipelineStats>
    where
        P: Send + Serialize + DeserializeOwned,
    {
        self.run(source, || ProcessTransform::spawn(worker), sink)
    }
}
