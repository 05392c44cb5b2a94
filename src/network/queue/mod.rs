//! Kernel packet queue abstraction.
//!
//! A capture handle hands out one packet at a time and expects exactly one
//! verdict for it before the next `recv`. The NFQUEUE implementation lives
//! in [`nfqueue`]; tests substitute scripted handles through [`QueueBinder`].

pub mod nfqueue;

use std::fmt;
use thiserror::Error;

pub use nfqueue::{free_queue_numbers, NfqueueHandle};

/// Final disposition of a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "accept"),
            Verdict::Drop => write!(f, "drop"),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Failed to open netlink queue socket: {0}")]
    Open(#[source] std::io::Error),

    #[error("Failed to bind queue {queue}: {source}")]
    Bind {
        queue: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to unbind queue {queue}: {source}")]
    Unbind {
        queue: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to receive from queue {queue}: {source}")]
    Recv {
        queue: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to issue verdict on queue {queue}: {source}")]
    Verdict {
        queue: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue {0} has no packet awaiting a verdict")]
    NoPendingPacket(u16),

    #[error("Queue {0} still has a packet awaiting a verdict")]
    VerdictPending(u16),
}

/// A bound kernel queue delivering packets to one capture worker.
pub trait CaptureHandle {
    /// Waits briefly for the next packet.
    ///
    /// Returns `Ok(None)` when nothing arrived within the poll interval so
    /// the caller can re-check its running flag.
    fn recv(&mut self) -> Result<Option<Vec<u8>>, QueueError>;

    /// Issues the verdict for the packet returned by the last `recv`,
    /// replacing its bytes when `replacement` is set.
    fn issue_verdict(
        &mut self,
        verdict: Verdict,
        replacement: Option<Vec<u8>>,
    ) -> Result<(), QueueError>;

    /// Unbinds the queue. Any packet still awaiting a verdict is accepted.
    fn close(&mut self) -> Result<(), QueueError>;
}

/// Opens capture handles for queue numbers.
pub trait QueueBinder: Send + Sync {
    fn bind(&self, queue_number: u16) -> Result<Box<dyn CaptureHandle>, QueueError>;
}
