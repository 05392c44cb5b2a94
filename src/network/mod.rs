//! Network module for packet interception and redirection.
//!
//! This module contains components for capturing traffic through netfilter
//! queues, rewriting it towards local listeners and steering it into the
//! queues with firewall rules.

pub mod core;
pub mod firewall;
pub mod modules;
pub mod processing;
pub mod queue;
