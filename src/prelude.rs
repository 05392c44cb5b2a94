//! Prelude module for convenient imports.
//!
//! This module re-exports commonly used types and traits from the crate,
//! allowing users to import everything they need with a single use statement:
//!
//! ```rust
//! use netdivert::prelude::*;
//! ```

// Error handling
pub use crate::error::{DivertError, Result};

// Engine
pub use crate::diverter::Diverter;

// Network core
pub use crate::network::core::{Field, FieldValue, LocalAddresses, PacketContext, Transport};

// Callbacks and statistics
pub use crate::network::modules::{
    DiversionStatistics, HookKind, ListenerLookup, ListenerRegistry, StatisticsSnapshot,
};

// Processing
pub use crate::network::processing::{CaptureSink, HookPipeline, HookSpec};

// Platform seams
pub use crate::network::firewall::{RuleInstaller, RuleRecord, RuleRemoval, RuleSpec};
pub use crate::network::queue::{CaptureHandle, QueueBinder, Verdict};
pub use crate::platform::{LinuxPlatform, Platform};

// Settings
pub use crate::settings::{DiverterSettings, NetworkMode, SettingsBuilder};
