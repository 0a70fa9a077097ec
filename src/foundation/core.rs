/// Zero-based position of a frame in the source stream.
///
/// Indices are assigned by the pipeline in pull order, are unique within a run,
/// and define the exact order in which frames reach the sink.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct FrameIndex(pub u64);
