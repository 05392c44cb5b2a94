//! Settings module for the diversion engine.
//!
//! This module contains the configuration read at startup: the network
//! mode, nonlocal logging policy, interface restriction and the simulated
//! listeners that diverted traffic is sent to.
//!
//! # Example
//!
//! ```rust
//! use netdivert::settings::SettingsBuilder;
//!
//! let settings = SettingsBuilder::new()
//!     .log_every_occurrence(false)
//!     .build();
//! assert!(settings.log_nonlocal_only_once);
//! ```

pub mod builder;
pub mod diverter;
pub mod file;
pub mod listeners;

use crate::network::core::Transport;
use std::path::PathBuf;
use thiserror::Error;

// Re-export commonly used types
pub use builder::SettingsBuilder;
pub use diverter::{DiverterSettings, NetworkMode};
pub use listeners::{ListenerSettings, ListenerTable};

/// Errors from loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("'{0}' is not a valid interface name")]
    InvalidInterface(String),

    #[error("Default listener '{0}' is not configured")]
    UnknownListener(String),

    #[error("Listener '{name}' is not a {expected} listener")]
    ListenerProtocol { name: String, expected: Transport },

    #[error("Listener '{0}' has no port")]
    InvalidPort(String),
}
