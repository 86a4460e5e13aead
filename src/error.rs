//! Error types shared by every module of the crate.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Input is shorter than the structure it claims to hold.
    #[error("packet too small: expected at least {expected} bytes, got {actual}")]
    PacketTooSmall { expected: usize, actual: usize },

    #[error("unsupported IP version {0}")]
    IpVersion(u8),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("not a DNS packet")]
    NotDns,

    #[error("malformed DNS message: {0}")]
    MalformedDns(&'static str),

    #[error("invalid rule `{line}`: {reason}")]
    InvalidRule { line: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("upstream {upstream} timed out after {timeout:?}")]
    Timeout { upstream: String, timeout: Duration },

    #[error("upstream {upstream} answered with an unusable message")]
    BadAnswer { upstream: String },

    #[error("SOCKS5 proxy error: {0}")]
    Socks(String),

    #[error(transparent)]
    SocksConnect(#[from] tokio_socks::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("session is {actual}, expected {expected}")]
    SessionState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("dispatch queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
