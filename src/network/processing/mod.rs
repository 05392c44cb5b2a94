//! Packet processing: the hook pipeline, the capture workers feeding it and
//! the lifecycle of the queues they read from.

pub mod lifecycle;
pub mod pipeline;
pub mod worker;

pub use lifecycle::{HookSpec, QueueDescriptor, QueueLifecycleManager, QueueState};
pub use pipeline::{CaptureSink, HandledPacket, HookPipeline};
