use thiserror::Error;

use crate::network::core::packet::PacketError;
use crate::network::firewall::FirewallError;
use crate::network::queue::QueueError;
use crate::settings::SettingsError;

#[derive(Debug, Error)]
pub enum DivertError {
    /// Error while rewriting a packet header
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Error from the firewall rule installer
    #[error("Firewall error: {0}")]
    Firewall(#[from] FirewallError),

    /// Error from the kernel packet queue
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Invalid or unreadable configuration
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// The process lacks the privileges needed to divert traffic
    #[error("Insufficient privileges: {0}")]
    Privilege(String),

    /// Fewer free queue numbers than hooks
    #[error("Could not procure {requested} netfilter queue numbers (found {available})")]
    QueueNumbers { requested: usize, available: usize },

    /// A startup step failed and everything started so far was rolled back
    #[error("Startup failed: {0}")]
    Startup(String),

    /// Error when a mutex/rwlock is poisoned
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    /// I/O errors from file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenient Result type alias using `DivertError`.
pub type Result<T> = std::result::Result<T, DivertError>;

impl DivertError {
    /// Creates a new lock poisoned error with a descriptive message.
    pub fn lock_poisoned(resource: &str) -> Self {
        Self::LockPoisoned(format!("Failed to acquire lock on {}", resource))
    }
}
