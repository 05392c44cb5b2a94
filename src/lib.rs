//! # netdivert - Traffic diversion for malware-analysis sandboxes
//!
//! netdivert intercepts the traffic of a monitored host through netfilter
//! queues and transparently redirects it to simulated protocol listeners,
//! logging every attempt to reach an address outside the sandbox.
//!
//! ## Modes
//!
//! * SingleHost - The sandbox itself runs the sample; foreign destinations
//!   are looped back to local listeners
//! * MultiHost - Another machine routes its traffic through this host;
//!   packets are observed and unbound ports redirected
//!
//! ## Architecture
//!
//! * `network::core` - Packet parsing and header rewriting
//! * `network::modules` - Redirection and nonlocal logging callbacks
//! * `network::processing` - Hook pipeline, capture workers, queue lifecycle
//! * `network::firewall` - iptables rules and the ledger that removes them
//! * `platform` - Kernel facilities behind a trait
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netdivert::prelude::*;
//! use std::sync::Arc;
//!
//! let settings = SettingsBuilder::new()
//!     .mode(NetworkMode::SingleHost)
//!     .listener("RawTCPListener", Transport::Tcp, 1337)
//!     .default_tcp_listener("RawTCPListener")
//!     .build();
//!
//! let mut diverter = Diverter::new(settings, Arc::new(LinuxPlatform::new()))?;
//! diverter.start()?;
//! ```

/// Engine composition
pub mod diverter;
/// Centralized error handling
pub mod error;
/// Packet interception and redirection
pub mod network;
/// Kernel facilities (firewall, queues, interfaces)
pub mod platform;
/// Prelude for convenient imports
pub mod prelude;
/// Configuration settings
pub mod settings;
/// Shared utility functions
pub mod utils;

// Re-export commonly used types
pub use error::{DivertError, Result};
