pub mod cancel;
pub(crate) mod queue;
pub(crate) mod reorder;
pub mod session;
