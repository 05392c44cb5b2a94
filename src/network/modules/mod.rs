//! Packet callbacks run by the hook pipeline.

pub mod callbacks;
pub mod nonlocal;
pub mod redirect;
pub mod stats;

// Re-export module structs for convenience
pub use callbacks::{Callback, CallbackContext, HookChains, HookKind};
pub use nonlocal::NonlocalTrafficMonitor;
pub use redirect::{ListenerLookup, ListenerRegistry, RedirectionPolicy};
pub use stats::{DiversionStatistics, StatisticsSnapshot};
