//! Minimal SOCKS5 UDP ASSOCIATE client (RFC 1928, no authentication).
//!
//! The control TCP connection must stay open for as long as the relay is
//! used; [`UdpAssociation`] owns it for that reason.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

use crate::error::{Error, Result};

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// An open UDP relay through a SOCKS5 server.
pub struct UdpAssociation {
    _control: TcpStream,
    socket: UdpSocket,
    relay: SocketAddr,
}

impl UdpAssociation {
    /// Negotiate a UDP relay with the SOCKS5 server at `proxy`.
    pub async fn open(proxy: SocketAddr) -> Result<Self> {
        let mut control = TcpStream::connect(proxy).await?;

        control.write_all(&[VERSION, 1, NO_AUTH]).await?;
        let mut choice = [0u8; 2];
        control.read_exact(&mut choice).await?;
        if choice != [VERSION, NO_AUTH] {
            return Err(Error::Socks(format!("method rejected: {choice:?}")));
        }

        // Client address unknown up front: 0.0.0.0:0.
        control
            .write_all(&[VERSION, CMD_UDP_ASSOCIATE, 0, ATYP_V4, 0, 0, 0, 0, 0, 0])
            .await?;
        let mut head = [0u8; 3];
        control.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::Socks(format!("bad reply version {}", head[0])));
        }
        if head[1] != 0 {
            return Err(Error::Socks(format!("UDP ASSOCIATE refused with code {}", head[1])));
        }
        let mut relay = read_addr(&mut control).await?;
        if relay.ip().is_unspecified() {
            relay.set_ip(proxy.ip());
        }
        trace!(%proxy, %relay, "SOCKS5 UDP relay ready");

        let bind: SocketAddr = match relay {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(relay).await?;

        Ok(Self {
            _control: control,
            socket,
            relay,
        })
    }

    pub fn relay(&self) -> SocketAddr {
        self.relay
    }

    /// Send one datagram to `target` through the relay.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
        self.socket.send(&encode_datagram(target, payload)).await?;
        Ok(())
    }

    /// Receive one datagram from the relay, returning its payload length and
    /// source. The payload is moved to the front of `buf`.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let n = self.socket.recv(buf).await?;
        let (from, offset) = decode_datagram(&buf[..n])?;
        buf.copy_within(offset..n, 0);
        Ok((n - offset, from))
    }
}

async fn read_addr(stream: &mut TcpStream) -> Result<SocketAddr> {
    let atyp = stream.read_u8().await?;
    let ip = match atyp {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(Error::Socks(format!("unsupported bind address type {other}"))),
    };
    let port = stream.read_u16().await?;
    Ok(SocketAddr::new(ip, port))
}

/// Wrap `payload` in a SOCKS5 UDP request header (RSV, FRAG=0, address).
pub fn encode_datagram(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(22 + payload.len());
    packet.extend_from_slice(&[0, 0, 0]);
    match target.ip() {
        IpAddr::V4(ip) => {
            packet.push(ATYP_V4);
            packet.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            packet.push(ATYP_V6);
            packet.extend_from_slice(&ip.octets());
        }
    }
    packet.extend_from_slice(&target.port().to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Parse a SOCKS5 UDP header, returning the source address and the offset
/// of the payload. Fragmented datagrams and domain sources are rejected.
pub fn decode_datagram(packet: &[u8]) -> Result<(SocketAddr, usize)> {
    let truncated = || Error::Socks("truncated UDP datagram".to_string());
    let header = packet.get(..4).ok_or_else(truncated)?;
    if header[2] != 0 {
        return Err(Error::Socks("fragmented UDP datagram".to_string()));
    }

    let (ip, port_at) = match header[3] {
        ATYP_V4 => {
            let octets: [u8; 4] = packet.get(4..8).ok_or_else(truncated)?.try_into().map_err(|_| truncated())?;
            (IpAddr::V4(Ipv4Addr::from(octets)), 8)
        }
        ATYP_V6 => {
            let octets: [u8; 16] = packet.get(4..20).ok_or_else(truncated)?.try_into().map_err(|_| truncated())?;
            (IpAddr::V6(Ipv6Addr::from(octets)), 20)
        }
        ATYP_DOMAIN => return Err(Error::Socks("domain source address in UDP reply".to_string())),
        other => return Err(Error::Socks(format!("unknown address type {other}"))),
    };
    let port = packet.get(port_at..port_at + 2).ok_or_else(truncated)?;
    Ok((
        SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]])),
        port_at + 2,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn datagram_header_layout() {
        let target: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let packet = encode_datagram(target, b"q");

        assert_eq!(packet, [0, 0, 0, 1, 8, 8, 8, 8, 0, 53, b'q']);
        assert_eq!(decode_datagram(&packet).unwrap(), (target, 10));
    }

    #[test]
    fn decode_rejects_fragments_and_truncation() {
        assert!(decode_datagram(&[0, 0, 1, 1, 8, 8, 8, 8, 0, 53]).is_err());
        assert!(decode_datagram(&[0, 0, 0, 1, 8, 8]).is_err());
        assert!(decode_datagram(&[0, 0, 0, 4, 0]).is_err());
    }

    /// A one-shot SOCKS5 server that relays a single datagram to `echo_to`
    /// and back.
    async fn fake_socks_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut control, _) = listener.accept().await.unwrap();
            let mut greet = [0u8; 3];
            control.read_exact(&mut greet).await.unwrap();
            control.write_all(&[5, 0]).await.unwrap();
            let mut request = [0u8; 10];
            control.read_exact(&mut request).await.unwrap();
            assert_eq!(request[1], CMD_UDP_ASSOCIATE);

            let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = relay.local_addr().unwrap().port().to_be_bytes();
            // Unspecified bind address: the client must fall back to the proxy IP.
            control
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, port[0], port[1]])
                .await
                .unwrap();

            let mut buf = [0u8; 512];
            let (n, client) = relay.recv_from(&mut buf).await.unwrap();
            let (target, offset) = decode_datagram(&buf[..n]).unwrap();
            let mut reply = buf[offset..n].to_vec();
            reply.reverse();
            relay.send_to(&encode_datagram(target, &reply), client).await.unwrap();

            // Hold the control connection until the client closes it.
            let _ = control.read_u8().await;
        });

        addr
    }

    #[tokio::test]
    async fn associate_and_relay_one_datagram() {
        let proxy = fake_socks_server().await;
        let association = UdpAssociation::open(proxy).await.unwrap();
        assert_eq!(association.relay().ip(), proxy.ip());

        let target: SocketAddr = "9.9.9.9:53".parse().unwrap();
        association.send_to(b"abc", target).await.unwrap();

        let mut buf = [0u8; 512];
        let (n, from) = association.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"cba");
        assert_eq!(from, target);
    }
}
