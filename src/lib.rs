//! tunsplit - rule-based traffic splitting for tunnel-mode proxies.
//!
//! Packets read from a tun device are classified against an ordered rule
//! list and handed to one virtual channel per target. A local DNS listener
//! races several upstreams, caches answers and teaches the classifier which
//! addresses belong to which host names.

pub mod cache;
pub mod capture;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod listener;
pub mod packet;
pub mod resolver;
pub mod rule;
pub mod socks5;
pub mod stats;
pub mod transport;
pub mod tunnel;
pub mod upstream;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
