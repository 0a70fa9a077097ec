//! The pipeline session: configuration, lifecycle control and the stage loops.
//!
//! A run wires four stages over two bounded MPMC queues:
//!
//! ```text
//! source -> [sequencer] -> dispatch queue -> [workers xN] -> result queue -> [reassembler] -> sink
//! ```
//!
//! The sequencer stamps frames with increasing indices, workers transform them
//! concurrently, and the reassembler drains results to the sink in strict index
//! order. The calling thread acts as the lifecycle controller: it opens the
//! source and sink up front, spawns the stages inside a thread scope, joins
//! them in any order and aggregates the outcome.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::capability::sink::FrameSink;
use crate::capability::source::FrameSource;
use crate::capability::transform::FrameTransform;
use crate::foundation::core::FrameIndex;
use crate::foundation::error::{FramepipeError, FramepipeResult};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::queue::{PollRecv, ResultMsg, WorkMsg, recv_polling, send_polling};
use crate::pipeline::reorder::{ReorderBuffer, Slot};

/// Options controlling a [`Pipeline`] run.
#[derive(Clone, Debug)]
pub struct PipelineOpts {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Dispatch queue capacity; the sequencer blocks when it is full (primary
    /// backpressure point).
    pub dispatch_capacity: usize,
    /// Result queue capacity; workers block when it is full.
    pub result_capacity: usize,
    /// Upper bound on how long any stage waits before re-checking cancellation.
    pub poll_interval: Duration,
    /// Stop pulling from the source after this many frames. `None` runs to
    /// stream exhaustion.
    pub max_frames: Option<u64>,
}

impl Default for PipelineOpts {
    fn default() -> Self {
        Self {
            worker_count: 2,
            dispatch_capacity: 8,
            result_capacity: 8,
            poll_interval: Duration::from_millis(100),
            max_frames: None,
        }
    }
}

impl PipelineOpts {
    pub fn validate(&self) -> FramepipeResult<()> {
        if self.worker_count == 0 {
            return Err(FramepipeError::validation("worker_count must be >= 1"));
        }
        if self.dispatch_capacity == 0 || self.result_capacity == 0 {
            return Err(FramepipeError::validation(
                "queue capacities must be >= 1",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(FramepipeError::validation(
                "poll_interval must be non-zero",
            ));
        }
        Ok(())
    }

    /// Reorder window: the maximum number of indices in flight at once, which
    /// is also the reorder buffer capacity.
    fn window(&self) -> usize {
        self.worker_count + self.result_capacity
    }
}

/// Counters describing a finished run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames pulled from the source and dispatched.
    pub frames_produced: u64,
    /// Frames delivered to the sink, in order.
    pub frames_emitted: u64,
    /// Frames skipped after a transform failure.
    pub frames_failed: u64,
    /// Frames dispatched but neither emitted nor failed (in flight when the
    /// run was cancelled).
    pub frames_discarded: u64,
    /// Indices of the skipped frames, in order.
    pub failed_frames: Vec<FrameIndex>,
    /// High-water mark of the reorder buffer.
    pub max_reorder_depth: usize,
    /// Whether the source was fully consumed (or its quota reached) and every
    /// produced frame was accounted for.
    pub completed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipelineState {
    Starting,
    Running,
    Draining,
    Failed,
    Stopped,
}

fn transition(state: &mut PipelineState, to: PipelineState) {
    tracing::debug!(from = ?*state, to = ?to, "pipeline state change");
    *state = to;
}

/// An ordered parallel frame-processing pipeline.
///
/// A `Pipeline` value carries validated options plus the shared [`CancelToken`]
/// and is cheap to construct, one per run. Cancellation is sticky: once the
/// token is tripped, any further run returns immediately with
/// `completed: false` and zero frames.
pub struct Pipeline {
    opts: PipelineOpts,
    cancel: CancelToken,
}

impl Pipeline {
    /// Validate `opts` and build a pipeline.
    pub fn new(opts: PipelineOpts) -> FramepipeResult<Self> {
        opts.validate()?;
        Ok(Self {
            opts,
            cancel: CancelToken::new(),
        })
    }

    /// Handle for requesting cancellation from outside the run (another
    /// thread, a Ctrl-C handler). Idempotent; see [`CancelToken`].
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the pipeline with in-process worker threads.
    ///
    /// `transform_factory` is invoked once per worker before anything starts,
    /// so each worker owns a private transform; a factory error aborts the run
    /// before the source is opened.
    ///
    /// Returns the run counters on completion or cancellation; fatal
    /// source/sink failures (and stage panics) surface as the error.
    #[tracing::instrument(skip_all, fields(workers = self.opts.worker_count))]
    pub fn run<P, T, F>(
        &self,
        source: &mut dyn FrameSource<P>,
        mut transform_factory: F,
        sink: &mut dyn FrameSink<P>,
    ) -> FramepipeResult<PipelineStats>
    where
        P: Send,
        T: FrameTransform<P>,
        F: FnMut() -> FramepipeResult<T>,
    {
        let mut state = PipelineState::Starting;
        tracing::debug!(state = ?state, "pipeline starting");

        let mut transforms = Vec::with_capacity(self.opts.worker_count);
        for _ in 0..self.opts.worker_count {
            transforms.push(transform_factory()?);
        }

        source.open().map_err(source_fatal)?;
        if let Err(e) = sink.begin() {
            let _ = source.close();
            transition(&mut state, PipelineState::Failed);
            return Err(sink_fatal(e));
        }

        let worker_count = self.opts.worker_count;
        let window = self.opts.window();
        let poll = self.opts.poll_interval;
        let max_frames = self.opts.max_frames;
        let cancel = self.cancel.clone();

        let (work_tx, work_rx) = bounded::<WorkMsg<P>>(self.opts.dispatch_capacity);
        let (res_tx, res_rx) = bounded::<ResultMsg<P>>(self.opts.result_capacity);
        // In-flight window: one credit per unresolved index, returned by the
        // reassembler. Caps the reorder buffer at `window` entries.
        let (credit_tx, credit_rx) = bounded::<()>(window);
        for _ in 0..window {
            credit_tx
                .send(())
                .expect("credit channel sized to the window");
        }

        let (seq_join, worker_joins, reasm_join) = thread::scope(|scope| {
            let sequencer = {
                let cancel = cancel.clone();
                scope.spawn(move || {
                    sequence_loop(source, work_tx, credit_rx, cancel, poll, max_frames, worker_count)
                })
            };

            let mut workers = Vec::with_capacity(worker_count);
            for (worker, transform) in transforms.into_iter().enumerate() {
                let work_rx = work_rx.clone();
                let res_tx = res_tx.clone();
                let cancel = cancel.clone();
                workers.push(
                    scope.spawn(move || worker_loop(worker, transform, work_rx, res_tx, cancel, poll)),
                );
            }
            drop(work_rx);
            drop(res_tx);

            let reassembler = {
                let cancel = cancel.clone();
                scope.spawn(move || {
                    reassemble_loop(sink, res_rx, credit_tx, cancel, poll, worker_count, window)
                })
            };

            transition(&mut state, PipelineState::Running);

            let seq_join = sequencer.join();
            transition(&mut state, PipelineState::Draining);
            let worker_joins: Vec<_> = workers.into_iter().map(|w| w.join()).collect();
            let reasm_join = reassembler.join();
            (seq_join, worker_joins, reasm_join)
        });

        let seq_out = seq_join
            .unwrap_or_else(|_| Err(FramepipeError::pipeline("sequencer thread panicked")));
        let reasm_out = reasm_join
            .unwrap_or_else(|_| Err(FramepipeError::pipeline("reassembler thread panicked")));
        let worker_panics = worker_joins.iter().filter(|join| join.is_err()).count();

        let (sequenced, reassembled) = match (seq_out, reasm_out) {
            (Err(e), _) => {
                transition(&mut state, PipelineState::Failed);
                transition(&mut state, PipelineState::Stopped);
                return Err(e);
            }
            (Ok(_), Err(e)) => {
                transition(&mut state, PipelineState::Failed);
                transition(&mut state, PipelineState::Stopped);
                return Err(e);
            }
            (Ok(s), Ok(r)) => (s, r),
        };
        if worker_panics > 0 {
            transition(&mut state, PipelineState::Failed);
            transition(&mut state, PipelineState::Stopped);
            return Err(FramepipeError::pipeline(format!(
                "{worker_panics} worker thread(s) panicked outside the transform"
            )));
        }

        let frames_failed = reassembled.failed.len() as u64;
        let frames_discarded = sequenced
            .produced
            .saturating_sub(reassembled.emitted + frames_failed);
        let completed = sequenced.exhausted && reassembled.drained && frames_discarded == 0;
        transition(&mut state, PipelineState::Stopped);
        tracing::info!(
            produced = sequenced.produced,
            emitted = reassembled.emitted,
            failed = frames_failed,
            discarded = frames_discarded,
            completed,
            "pipeline stopped"
        );

        Ok(PipelineStats {
            frames_produced: sequenced.produced,
            frames_emitted: reassembled.emitted,
            frames_failed,
            frames_discarded,
            failed_frames: reassembled.failed,
            max_reorder_depth: reassembled.max_depth,
            completed,
        })
    }
}

fn source_fatal(e: FramepipeError) -> FramepipeError {
    match e {
        FramepipeError::Source(_) => e,
        other => FramepipeError::source(other.to_string()),
    }
}

fn sink_fatal(e: FramepipeError) -> FramepipeError {
    match e {
        FramepipeError::Sink(_) => e,
        other => FramepipeError::sink(other.to_string()),
    }
}

struct SequencerOutcome {
    produced: u64,
    /// True when the loop ended on stream exhaustion or quota, false when it
    /// was cancelled mid-stream.
    exhausted: bool,
}

fn sequence_loop<P: Send>(
    source: &mut dyn FrameSource<P>,
    work_tx: Sender<WorkMsg<P>>,
    credits: Receiver<()>,
    cancel: CancelToken,
    poll: Duration,
    max_frames: Option<u64>,
    worker_count: usize,
) -> FramepipeResult<SequencerOutcome> {
    let mut produced: u64 = 0;
    let mut exhausted = false;
    let mut fatal = None;

    loop {
        if cancel.is_canceled() {
            break;
        }
        if max_frames.is_some_and(|quota| produced >= quota) {
            exhausted = true;
            break;
        }
        match recv_polling(&credits, poll) {
            PollRecv::Msg(()) => {}
            PollRecv::Idle => continue,
            PollRecv::Closed => break,
        }
        match source.next_frame() {
            Ok(Some(frame)) => {
                let msg = WorkMsg::Frame(FrameIndex(produced), frame);
                if !send_polling(&work_tx, msg, poll, &cancel) {
                    break;
                }
                produced += 1;
            }
            Ok(None) => {
                exhausted = true;
                break;
            }
            Err(e) => {
                cancel.cancel();
                fatal = Some(source_fatal(e));
                break;
            }
        }
    }

    // One end sentinel per worker; each worker exits on its first one. Under
    // cancellation delivery is best-effort, workers bail out on the token.
    for _ in 0..worker_count {
        if !send_polling(&work_tx, WorkMsg::End, poll, &cancel) {
            break;
        }
    }
    if let Err(e) = source.close() {
        tracing::warn!(error = %e, "frame source close failed");
    }

    match fatal {
        Some(e) => {
            tracing::error!(frames_produced = produced, error = %e, "frame source failed");
            Err(e)
        }
        None => Ok(SequencerOutcome {
            produced,
            exhausted,
        }),
    }
}

fn worker_loop<P, T>(
    worker: usize,
    mut transform: T,
    work_rx: Receiver<WorkMsg<P>>,
    res_tx: Sender<ResultMsg<P>>,
    cancel: CancelToken,
    poll: Duration,
) where
    P: Send,
    T: FrameTransform<P>,
{
    loop {
        if cancel.is_canceled() {
            break;
        }
        let (idx, frame) = match recv_polling(&work_rx, poll) {
            PollRecv::Msg(WorkMsg::Frame(idx, frame)) => (idx, frame),
            PollRecv::Msg(WorkMsg::End) => break,
            PollRecv::Idle => continue,
            PollRecv::Closed => break,
        };

        // A panicking transform must still yield a failure marker, or the
        // in-order drain would wait on this index forever.
        let msg = match catch_unwind(AssertUnwindSafe(|| transform.apply(frame))) {
            Ok(Ok(out)) => ResultMsg::Done(idx, out),
            Ok(Err(e)) => {
                tracing::warn!(worker, frame = idx.0, error = %e, "transform failed; frame will be skipped");
                ResultMsg::Failed(idx, e.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::warn!(worker, frame = idx.0, reason, "transform panicked; frame will be skipped");
                ResultMsg::Failed(idx, format!("transform panicked: {reason}"))
            }
        };
        if !send_polling(&res_tx, msg, poll, &cancel) {
            break;
        }
    }

    // Completion token. Under cancellation the drain no longer counts these,
    // so a failed delivery is fine.
    let _ = send_polling(&res_tx, ResultMsg::WorkerExit, poll, &cancel);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}

struct ReassembleOutcome {
    emitted: u64,
    failed: Vec<FrameIndex>,
    max_depth: usize,
    /// True when every worker's completion token arrived and the buffer was
    /// fully drained.
    drained: bool,
}

fn reassemble_loop<P: Send>(
    sink: &mut dyn FrameSink<P>,
    res_rx: Receiver<ResultMsg<P>>,
    credits: Sender<()>,
    cancel: CancelToken,
    poll: Duration,
    worker_count: usize,
    window: usize,
) -> FramepipeResult<ReassembleOutcome> {
    let mut buffer = ReorderBuffer::with_capacity(window);
    let mut next: u64 = 0;
    let mut workers_done = 0usize;
    let mut emitted: u64 = 0;
    let mut failed = Vec::new();
    let mut drained = false;
    let mut fatal: Option<FramepipeError> = None;

    loop {
        if workers_done == worker_count && buffer.is_empty() {
            drained = true;
            break;
        }
        if cancel.is_canceled() {
            break;
        }
        let inserted = match recv_polling(&res_rx, poll) {
            PollRecv::Msg(ResultMsg::Done(idx, frame)) => buffer.insert(idx.0, Slot::Done(frame)),
            PollRecv::Msg(ResultMsg::Failed(idx, reason)) => {
                buffer.insert(idx.0, Slot::Failed(reason))
            }
            PollRecv::Msg(ResultMsg::WorkerExit) => {
                workers_done += 1;
                continue;
            }
            PollRecv::Idle => continue,
            PollRecv::Closed => {
                drained = workers_done == worker_count && buffer.is_empty();
                break;
            }
        };
        let step = inserted.and_then(|()| {
            drain_ready(&mut buffer, &mut next, sink, &credits, &mut emitted, &mut failed)
        });
        if let Err(e) = step {
            cancel.cancel();
            tracing::error!(frames_emitted = emitted, error = %e, "in-order delivery failed");
            fatal = Some(e);
            break;
        }
    }

    if let Err(e) = sink.end() {
        let e = sink_fatal(e);
        cancel.cancel();
        if fatal.is_none() {
            tracing::error!(frames_emitted = emitted, error = %e, "sink close failed");
            fatal = Some(e);
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(ReassembleOutcome {
            emitted,
            failed,
            max_depth: buffer.max_occupancy(),
            drained,
        }),
    }
}

/// Drain while the next expected index is buffered: emit successes in order,
/// skip failure markers, and return one in-flight credit per resolved index.
fn drain_ready<P>(
    buffer: &mut ReorderBuffer<P>,
    next: &mut u64,
    sink: &mut dyn FrameSink<P>,
    credits: &Sender<()>,
    emitted: &mut u64,
    failed: &mut Vec<FrameIndex>,
) -> FramepipeResult<()> {
    while let Some(slot) = buffer.take(*next) {
        match slot {
            Slot::Done(frame) => {
                sink.push_frame(FrameIndex(*next), frame).map_err(sink_fatal)?;
                *emitted += 1;
            }
            Slot::Failed(_) => failed.push(FrameIndex(*next)),
        }
        *next += 1;
        let _ = credits.try_send(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::sink::InMemorySink;
    use crate::capability::source::IterSource;
    use crate::capability::transform::FnTransform;
    use std::time::Instant;

    fn opts(worker_count: usize) -> PipelineOpts {
        PipelineOpts {
            worker_count,
            dispatch_capacity: 4,
            result_capacity: 4,
            poll_interval: Duration::from_millis(5),
            max_frames: None,
        }
    }

    fn words() -> Vec<String> {
        ["alpha", "bravo", "charlie", "delta", "echo"]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Stagger worker completion so results hit the result queue roughly as
    /// bravo, delta, alpha, echo, charlie while delivery must stay in order.
    fn staggered_upper(word: String) -> FramepipeResult<String> {
        let millis = match word.as_str() {
            "alpha" => 40,
            "bravo" => 5,
            "charlie" => 90,
            "delta" => 15,
            "echo" => 55,
            _ => 0,
        };
        std::thread::sleep(Duration::from_millis(millis));
        Ok(word.to_uppercase())
    }

    #[test]
    fn delivery_order_matches_source_order() {
        let pipeline = Pipeline::new(opts(3)).unwrap();
        let mut source = IterSource::new(words().into_iter());
        let mut sink = InMemorySink::new();

        let stats = pipeline
            .run(&mut source, || Ok(FnTransform::new(staggered_upper)), &mut sink)
            .unwrap();

        let delivered: Vec<_> = sink
            .frames()
            .iter()
            .map(|(idx, word)| (idx.0, word.as_str()))
            .collect();
        assert_eq!(
            delivered,
            vec![
                (0, "ALPHA"),
                (1, "BRAVO"),
                (2, "CHARLIE"),
                (3, "DELTA"),
                (4, "ECHO"),
            ]
        );
        assert!(sink.ended());
        assert!(stats.completed);
        assert_eq!(stats.frames_produced, 5);
        assert_eq!(stats.frames_emitted, 5);
        assert_eq!(stats.frames_failed, 0);
        assert_eq!(stats.frames_discarded, 0);
        assert!(stats.max_reorder_depth <= 3 + 4);
    }

    #[test]
    fn failed_frame_is_skipped_without_stalling() {
        let pipeline = Pipeline::new(opts(3)).unwrap();
        let mut source = IterSource::new(words().into_iter());
        let mut sink = InMemorySink::new();

        let transform = |word: String| -> FramepipeResult<String> {
            if word == "charlie" {
                return Err(FramepipeError::transform("synthetic failure"));
            }
            staggered_upper(word)
        };
        let stats = pipeline
            .run(&mut source, || Ok(FnTransform::new(transform)), &mut sink)
            .unwrap();

        let delivered: Vec<_> = sink
            .frames()
            .iter()
            .map(|(idx, word)| (idx.0, word.as_str()))
            .collect();
        assert_eq!(
            delivered,
            vec![(0, "ALPHA"), (1, "BRAVO"), (3, "DELTA"), (4, "ECHO")]
        );
        assert!(stats.completed);
        assert_eq!(stats.frames_failed, 1);
        assert_eq!(stats.failed_frames, vec![FrameIndex(2)]);
        assert_eq!(stats.frames_emitted, 4);
    }

    #[test]
    fn panicking_transform_is_contained() {
        let pipeline = Pipeline::new(opts(2)).unwrap();
        let mut source = IterSource::new(words().into_iter());
        let mut sink = InMemorySink::new();

        let transform = |word: String| -> FramepipeResult<String> {
            if word == "bravo" {
                panic!("boom");
            }
            Ok(word.to_uppercase())
        };
        let stats = pipeline
            .run(&mut source, || Ok(FnTransform::new(transform)), &mut sink)
            .unwrap();

        assert!(stats.completed);
        assert_eq!(stats.failed_frames, vec![FrameIndex(1)]);
        assert_eq!(stats.frames_emitted, 4);
    }

    #[test]
    fn parallel_run_matches_single_worker_run() {
        let inputs: Vec<String> = (0..32).map(|n| format!("frame-{n}")).collect();
        let transform = |word: String| -> FramepipeResult<String> {
            let jitter = word.len() as u64 % 4;
            std::thread::sleep(Duration::from_millis(jitter));
            Ok(word.to_uppercase())
        };

        let mut baseline = InMemorySink::new();
        Pipeline::new(opts(1))
            .unwrap()
            .run(
                &mut IterSource::new(inputs.clone().into_iter()),
                || Ok(FnTransform::new(transform)),
                &mut baseline,
            )
            .unwrap();

        let mut parallel = InMemorySink::new();
        Pipeline::new(opts(4))
            .unwrap()
            .run(
                &mut IterSource::new(inputs.into_iter()),
                || Ok(FnTransform::new(transform)),
                &mut parallel,
            )
            .unwrap();

        assert_eq!(baseline.frames(), parallel.frames());
    }

    #[test]
    fn reorder_buffer_stays_within_the_window() {
        let run_opts = PipelineOpts {
            worker_count: 4,
            dispatch_capacity: 4,
            result_capacity: 2,
            poll_interval: Duration::from_millis(5),
            max_frames: None,
        };
        let pipeline = Pipeline::new(run_opts).unwrap();
        let inputs: Vec<u64> = (0..24).collect();
        let mut source = IterSource::new(inputs.into_iter());
        let mut sink = InMemorySink::new();

        // Stall the first frame so later results pile up behind it.
        let transform = |n: u64| -> FramepipeResult<u64> {
            if n == 0 {
                std::thread::sleep(Duration::from_millis(120));
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(n)
        };
        let stats = pipeline
            .run(&mut source, || Ok(FnTransform::new(transform)), &mut sink)
            .unwrap();

        assert!(stats.completed);
        assert!(stats.max_reorder_depth >= 1);
        assert!(stats.max_reorder_depth <= 4 + 2);
        let delivered: Vec<u64> = sink.frames().iter().map(|(_, n)| *n).collect();
        assert_eq!(delivered, (0..24).collect::<Vec<_>>());
    }

    #[test]
    fn quota_stops_an_unbounded_source() {
        let run_opts = PipelineOpts {
            max_frames: Some(10),
            ..opts(3)
        };
        let pipeline = Pipeline::new(run_opts).unwrap();
        let mut source = IterSource::new((0u64..).map(|n| n.to_string()));
        let mut sink = InMemorySink::new();

        let stats = pipeline
            .run(
                &mut source,
                || Ok(FnTransform::new(|s: String| Ok(s))),
                &mut sink,
            )
            .unwrap();

        assert!(stats.completed);
        assert_eq!(stats.frames_produced, 10);
        assert_eq!(stats.frames_emitted, 10);
    }

    #[test]
    fn cancellation_stops_an_unbounded_source() {
        let pipeline = Pipeline::new(opts(3)).unwrap();
        let token = pipeline.cancel_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            token.cancel();
        });

        let mut source = IterSource::new((0u64..).map(|n| n.to_string()));
        let mut sink = InMemorySink::new();
        let started = Instant::now();
        let stats = pipeline
            .run(
                &mut source,
                || {
                    Ok(FnTransform::new(|s: String| {
                        std::thread::sleep(Duration::from_millis(3));
                        Ok(s)
                    }))
                },
                &mut sink,
            )
            .unwrap();
        canceller.join().unwrap();

        assert!(!stats.completed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            stats.frames_produced,
            stats.frames_emitted + stats.frames_failed + stats.frames_discarded
        );
        assert!(sink.ended());
    }

    #[test]
    fn already_cancelled_pipeline_runs_to_empty_stop() {
        let pipeline = Pipeline::new(opts(2)).unwrap();
        pipeline.cancel_token().cancel();
        // Idempotent: a second stop has no further effect.
        pipeline.cancel_token().cancel();

        let mut source = IterSource::new(words().into_iter());
        let mut sink = InMemorySink::new();
        let stats = pipeline
            .run(
                &mut source,
                || Ok(FnTransform::new(|s: String| Ok(s))),
                &mut sink,
            )
            .unwrap();

        assert!(!stats.completed);
        assert_eq!(stats.frames_emitted, 0);
        assert!(sink.ended());
    }

    #[test]
    fn empty_source_completes_cleanly() {
        let pipeline = Pipeline::new(opts(2)).unwrap();
        let mut source = IterSource::new(Vec::<String>::new().into_iter());
        let mut sink = InMemorySink::new();

        let stats = pipeline
            .run(
                &mut source,
                || Ok(FnTransform::new(|s: String| Ok(s))),
                &mut sink,
            )
            .unwrap();

        assert!(stats.completed);
        assert_eq!(stats.frames_produced, 0);
        assert!(sink.frames().is_empty());
        assert!(sink.ended());
    }

    struct FailingOpenSource;

    impl FrameSource<String> for FailingOpenSource {
        fn open(&mut self) -> FramepipeResult<()> {
            Err(FramepipeError::source("device unavailable"))
        }

        fn next_frame(&mut self) -> FramepipeResult<Option<String>> {
            Ok(None)
        }

        fn close(&mut self) -> FramepipeResult<()> {
            Ok(())
        }
    }

    #[test]
    fn source_open_failure_aborts_before_start() {
        let pipeline = Pipeline::new(opts(2)).unwrap();
        let mut sink = InMemorySink::new();

        let err = pipeline
            .run(
                &mut FailingOpenSource,
                || Ok(FnTransform::new(|s: String| Ok(s))),
                &mut sink,
            )
            .unwrap_err();

        assert!(matches!(err, FramepipeError::Source(_)));
        assert!(!sink.ended());
        assert!(sink.frames().is_empty());
    }

    struct FailingPushSink {
        fail_at: u64,
        delivered: Vec<u64>,
        ended: bool,
    }

    impl FrameSink<String> for FailingPushSink {
        fn begin(&mut self) -> FramepipeResult<()> {
            Ok(())
        }

        fn push_frame(&mut self, idx: FrameIndex, _frame: String) -> FramepipeResult<()> {
            if idx.0 == self.fail_at {
                return Err(FramepipeError::sink("encoder rejected frame"));
            }
            self.delivered.push(idx.0);
            Ok(())
        }

        fn end(&mut self) -> FramepipeResult<()> {
            self.ended = true;
            Ok(())
        }
    }

    #[test]
    fn sink_failure_aborts_the_run() {
        let pipeline = Pipeline::new(opts(3)).unwrap();
        let mut source = IterSource::new(words().into_iter());
        let mut sink = FailingPushSink {
            fail_at: 2,
            delivered: Vec::new(),
            ended: false,
        };

        let err = pipeline
            .run(
                &mut source,
                || Ok(FnTransform::new(|s: String| Ok(s))),
                &mut sink,
            )
            .unwrap_err();

        assert!(matches!(err, FramepipeError::Sink(_)));
        assert_eq!(sink.delivered, vec![0, 1]);
        assert!(sink.ended);
    }

    #[test]
    fn factory_failure_aborts_before_opening_anything() {
        let pipeline = Pipeline::new(opts(2)).unwrap();
        let mut source = IterSource::new(words().into_iter());
        let mut sink = InMemorySink::<String>::new();

        let err = pipeline
            .run(
                &mut source,
                || -> FramepipeResult<FnTransform<fn(String) -> FramepipeResult<String>>> {
                    Err(FramepipeError::validation("model missing"))
                },
                &mut sink,
            )
            .unwrap_err();

        assert!(matches!(err, FramepipeError::Validation(_)));
        assert!(!sink.ended());
    }

    #[test]
    fn options_are_validated() {
        assert!(Pipeline::new(PipelineOpts {
            worker_count: 0,
            ..PipelineOpts::default()
        })
        .is_err());
        assert!(Pipeline::new(PipelineOpts {
            dispatch_capacity: 0,
            ..PipelineOpts::default()
        })
        .is_err());
        assert!(Pipeline::new(PipelineOpts {
            poll_interval: Duration::ZERO,
            ..PipelineOpts::default()
        })
        .is_err());
        assert!(Pipeline::new(PipelineOpts::default()).is_ok());
    }
}
