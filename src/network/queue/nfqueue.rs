//! Netfilter queue handles backed by the `nfq` crate.
//!
//! Also reads the kernel's list of bound queues so queue numbers already in
//! use by another process are skipped.

use crate::network::queue::{CaptureHandle, QueueError, Verdict};
use log::{debug, warn};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::thread;
use std::time::Duration;

/// Kernel listing of bound netfilter queues.
pub const NFNETLINK_QUEUE_PROC: &str = "/proc/net/netfilter/nfnetlink_queue";

/// How long `recv` sleeps when no packet is waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A netfilter queue bound through the `nfq` netlink socket.
pub struct NfqueueHandle {
    queue: nfq::Queue,
    number: u16,
    pending: Option<nfq::Message>,
    bound: bool,
}

impl NfqueueHandle {
    /// Opens a netlink socket and binds it to `number`.
    ///
    /// The socket is non-blocking so the capture loop can observe its
    /// running flag between packets.
    pub fn bind(number: u16) -> Result<Self, QueueError> {
        let mut queue = nfq::Queue::open().map_err(QueueError::Open)?;
        queue
            .bind(number)
            .map_err(|source| QueueError::Bind { queue: number, source })?;
        queue.set_nonblocking(true);

        debug!("Bound netfilter queue {}", number);
        Ok(Self {
            queue,
            number,
            pending: None,
            bound: true,
        })
    }

    pub fn number(&self) -> u16 {
        self.number
    }
}

impl CaptureHandle for NfqueueHandle {
    fn recv(&mut self) -> Result<Option<Vec<u8>>, QueueError> {
        if self.pending.is_some() {
            return Err(QueueError::VerdictPending(self.number));
        }

        match self.queue.recv() {
            Ok(msg) => {
                let payload = msg.get_payload().to_vec();
                self.pending = Some(msg);
                Ok(Some(payload))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
                Ok(None)
            }
            Err(source) => Err(QueueError::Recv {
                queue: self.number,
                source,
            }),
        }
    }

    fn issue_verdict(
        &mut self,
        verdict: Verdict,
        replacement: Option<Vec<u8>>,
    ) -> Result<(), QueueError> {
        let Some(mut msg) = self.pending.take() else {
            return Err(QueueError::NoPendingPacket(self.number));
        };

        if let Some(octets) = replacement {
            msg.set_payload(octets);
        }
        msg.set_verdict(match verdict {
            Verdict::Accept => nfq::Verdict::Accept,
            Verdict::Drop => nfq::Verdict::Drop,
        });

        self.queue.verdict(msg).map_err(|source| QueueError::Verdict {
            queue: self.number,
            source,
        })
    }

    fn close(&mut self) -> Result<(), QueueError> {
        if self.pending.is_some() {
            warn!(
                "Queue {} closed with a packet awaiting a verdict, accepting it",
                self.number
            );
            self.issue_verdict(Verdict::Accept, None)?;
        }

        if !self.bound {
            return Ok(());
        }
        self.bound = false;
        self.queue
            .unbind(self.number)
            .map_err(|source| QueueError::Unbind {
                queue: self.number,
                source,
            })?;

        debug!("Unbound netfilter queue {}", self.number);
        Ok(())
    }
}

/// Queue numbers already bound by some process, from the kernel listing.
///
/// Each line of the listing starts with the queue number; unparseable lines
/// are skipped.
pub fn used_queue_numbers(listing: &str) -> HashSet<u16> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|field| field.parse().ok())
        .collect()
}

/// The lowest `count` queue numbers not present in the kernel listing.
///
/// Returns fewer than `count` numbers when the queue number space is
/// exhausted; the caller decides whether that is fatal.
pub fn free_queue_numbers(listing: &str, count: usize) -> Vec<u16> {
    let used = used_queue_numbers(listing);
    (0..=u16::MAX)
        .filter(|number| !used.contains(number))
        .take(count)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "    0  31337     0 2 65531     0     0        0  1
    1  31338     0 2 65531     0     0        0  1
    3  31339     5 2 65531     0     0       12  1
";

    #[test]
    fn test_used_queue_numbers() {
        let used = used_queue_numbers(LISTING);
        assert_eq!(used, HashSet::from([0, 1, 3]));
    }

    #[test]
    fn test_free_queue_numbers_skip_used() {
        assert_eq!(free_queue_numbers(LISTING, 3), vec![2, 4, 5]);
    }

    #[test]
    fn test_free_queue_numbers_empty_listing() {
        assert_eq!(free_queue_numbers("", 2), vec![0, 1]);
        assert!(free_queue_numbers("", 0).is_empty());
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let used = used_queue_numbers("garbage\n\n  7 1 2\n");
        assert_eq!(used, HashSet::from([7]));
    }
}
