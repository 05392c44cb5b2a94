//! Core network functionality.
//!
//! This module contains the packet representation shared by every hook,
//! a builder for synthetic packets and the set of addresses owned by the local host.

pub mod addresses;
pub mod builder;
pub mod packet;

// Re-export commonly used types
pub use addresses::LocalAddresses;
pub use builder::PacketBuilder;
pub use packet::{Field, FieldValue, PacketContext, PacketError, Transport};
