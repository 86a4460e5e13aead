//! Virtual channels: one local datagram pipe per routing target.
//!
//! The engine keeps one end as a tokio [`UnixDatagram`]; the other end is a
//! plain descriptor the host binds to its outbound connection for that
//! target. Datagram sockets keep packet boundaries, so every read is exactly
//! one IP packet.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use socket2::{Domain, Socket, Type};
use tokio::net::UnixDatagram;

/// Kernel buffer size for each end of a channel.
pub const CHANNEL_BUFFER_SIZE: usize = 1024 * 1024;

/// A bidirectional packet pipe bound to one target name.
pub struct VirtualChannel {
    name: String,
    engine: UnixDatagram,
    host: OwnedFd,
}

impl VirtualChannel {
    /// Create a non-blocking socket pair with enlarged buffers.
    /// Must be called within a tokio runtime.
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        let (engine, host) = Socket::pair(Domain::UNIX, Type::DGRAM, None)?;
        for socket in [&engine, &host] {
            socket.set_nonblocking(true)?;
            socket.set_recv_buffer_size(CHANNEL_BUFFER_SIZE)?;
            socket.set_send_buffer_size(CHANNEL_BUFFER_SIZE)?;
        }

        let engine = std::os::unix::net::UnixDatagram::from(OwnedFd::from(engine));
        Ok(Self {
            name: name.into(),
            engine: UnixDatagram::from_std(engine)?,
            host: OwnedFd::from(host),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor number of the host end, as reported to the host.
    pub fn host_fd(&self) -> RawFd {
        self.host.as_raw_fd()
    }

    /// Duplicate the host end.
    pub fn clone_host(&self) -> io::Result<OwnedFd> {
        self.host.try_clone()
    }

    /// Push a packet towards the host.
    pub async fn send(&self, packet: &[u8]) -> io::Result<()> {
        let sent = self.engine.send(packet).await?;
        if sent != packet.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram write"));
        }
        Ok(())
    }

    /// Receive the next packet coming back from the host.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.engine.recv(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_cross_in_both_directions() {
        let channel = VirtualChannel::new("proxyA").unwrap();
        let host = std::os::unix::net::UnixDatagram::from(channel.clone_host().unwrap());
        host.set_nonblocking(false).unwrap();

        channel.send(b"to host").await.unwrap();
        let mut buf = [0u8; 64];
        let n = host.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"to host");

        host.send(b"to engine").unwrap();
        let n = channel.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"to engine");
        assert_eq!(channel.name(), "proxyA");
        assert!(channel.host_fd() >= 0);
    }
}
