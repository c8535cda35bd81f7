//! Data-flow graph primitives
//!
//! - [`Junction`]: one-to-many fan-out point with per-edge quiescence barriers
//! - [`BranchQueue`]: bounded leaky queue reporting overrun and underrun
//! - [`Branch`]: queue plus terminal sink, attached to and detached from a
//!   junction while data flows

pub mod branch;
pub mod junction;
pub mod queue;

pub use branch::{
    Branch, BranchId, BranchNotice, BranchSink, BranchStats, NoticeHandler, ProbeChain,
    ProbeContext, ProbeId, ProbeReturn,
};
pub use junction::{Edge, EdgeTarget, Junction};
pub(crate) use junction::spawn_worker;
pub use queue::{BranchQueue, QueueConfig, QueueSignal, Queued, SignalHandler};
