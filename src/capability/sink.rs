use crate::foundation::core::FrameIndex;
use crate::foundation::error::FramepipeResult;

/// Sink contract for consuming transformed frames in source order.
///
/// Ordering contract: `push_frame` is called in strictly increasing
/// [`FrameIndex`] order, exactly once per surviving index (indices whose
/// transform failed are skipped and reported separately).
///
/// `begin` is called exactly once before any frame, and `end` exactly once
/// afterwards, including on cancelled runs, so encoders can finalize their
/// output. A `begin`, `push_frame` or `end` failure is fatal to the run.
pub trait FrameSink<P>: Send {
    /// Called once before any frames are pushed.
    fn begin(&mut self) -> FramepipeResult<()>;
    /// Consume one frame in strictly increasing index order.
    fn push_frame(&mut self, idx: FrameIndex, frame: P) -> FramepipeResult<()>;
    /// Called once after the last frame.
    fn end(&mut self) -> FramepipeResult<()>;
}

/// In-memory sink for tests and debugging.
#[derive(Debug, Default)]
pub struct InMemorySink<P> {
    frames: Vec<(FrameIndex, P)>,
    ended: bool,
}

impl<P> InMemorySink<P> {
    /// Create a new in-memory sink.
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            ended: false,
        }
    }

    /// Borrow the captured frames, in delivery order.
    pub fn frames(&self) -> &[(FrameIndex, P)] {
        &self.frames
    }

    /// Whether `end` has been called.
    pub fn ended(&self) -> bool {
        self.ended
    }
}

impl<P: Send> FrameSink<P> for InMemorySink<P> {
    fn begin(&mut self) -> FramepipeResult<()> {
        self.frames.clear();
        self.ended = false;
        Ok(())
    }

    fn push_frame(&mut self, idx: FrameIndex, frame: P) -> FramepipeResult<()> {
        self.frames.push((idx, frame));
        Ok(())
    }

    fn end(&mut self) -> FramepipeResult<()> {
        self.ended = true;
        Ok(())
    }
}
