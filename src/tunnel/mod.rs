//! Tunnel demultiplexer.
//!
//! Packets read from the tunnel device are classified and fanned out to
//! per-target [`VirtualChannel`]s; packets coming back on any channel are
//! merged into a single writer for the tunnel.

pub mod channel;
pub mod device;
pub mod session;

pub use channel::VirtualChannel;
pub use device::TunDevice;
pub use session::{ChannelMap, DEFAULT_CHANNEL, Session, SessionState};
