//! Framepipe is an ordered parallel frame-processing pipeline.
//!
//! A [`Pipeline`] pulls numbered frames from a [`FrameSource`], fans them out to a
//! pool of workers that each apply an expensive [`FrameTransform`], and delivers
//! the results to a [`FrameSink`] in strict source order, regardless of the order
//! in which workers finish.
//!
//! # Pipeline overview
//!
//! 1. **Sequence**: pull frames from the source and stamp each with a [`FrameIndex`]
//! 2. **Dispatch**: feed `(index, frame)` pairs through a bounded queue (backpressure)
//! 3. **Transform**: `worker_count` workers apply the transform concurrently,
//!    each holding its own private transform instance
//! 4. **Reassemble**: buffer out-of-order results in a fixed-capacity ring and
//!    drain them to the sink while the next expected index is present
//!
//! The key design constraints:
//!
//! - **No unsafe**: `unsafe` is forbidden in this crate.
//! - **Strict ordering**: the sink sees exactly the source order, always.
//! - **Bounded memory**: queue capacities plus an in-flight window cap the
//!   reorder buffer at `worker_count + result_capacity` entries.
//! - **Cooperative cancellation**: every blocking point polls a shared
//!   [`CancelToken`] on a short, configurable interval.
//! - **No lost indices**: a failed (or panicking) transform yields a failure
//!   marker for its index instead of a silent drop, so the drain never stalls.
//!
//! Workers run either as in-process threads ([`Pipeline::run`]) or as isolated
//! child processes speaking a line-delimited JSON protocol over stdio
//! ([`Pipeline::run_process`] + [`run_worker_stdio`] on the child side). Both
//! substrates share the same queues, sentinels and polling contract.
#![forbid(unsafe_code)]

mod capability;
mod foundation;
mod pipeline;
mod process;

pub use crate::capability::sink::{FrameSink, InMemorySink};
pub use crate::capability::source::{FrameSource, IterSource};
pub use crate::capability::transform::{FnTransform, FrameTransform};
pub use crate::foundation::core::FrameIndex;
pub use crate::foundation::error::{FramepipeError, FramepipeResult};
pub use crate::pipeline::cancel::CancelToken;
pub use crate::pipeline::session::{Pipeline, PipelineOpts, PipelineStats};
pub use crate::process::wire::run_worker_stdio;
pub use crate::process::worker::{ProcessTransform, WorkerCommand};
