//! Raw IP packet codec.
//!
//! Packets are parsed in place: an [`IpPacket`] borrows the buffer it was
//! read from and keeps the original header bytes, so serializing it again
//! reproduces the input exactly, including any address-family prefix.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::dns;
use crate::error::{Error, Result};

pub const AF_INET: u32 = 2;
pub const AF_INET6: u32 = 10;

pub const DNS_PORT: u16 = 53;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const UDP_HEADER: usize = 8;
const TCP_MIN_HEADER: usize = 20;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

// IPv6 extension headers walked before the upper-layer header.
const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_AUTH: u8 = 51;
const EXT_DEST_OPTS: u8 = 60;

/// How packets are framed on the tunnel descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Bare IP packets.
    Raw,
    /// Every packet is preceded by a 4-byte big-endian address family.
    AfPrefix,
    /// Decide per packet from the first nibble.
    #[default]
    Auto,
}

/// Transport protocol of a packet or flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
    Other(u8),
}

impl Transport {
    fn from_protocol(protocol: u8) -> Self {
        match protocol {
            PROTO_TCP => Transport::Tcp,
            PROTO_UDP => Transport::Udp,
            other => Transport::Other(other),
        }
    }
}

/// A borrowed view over one IPv4 or IPv6 packet.
#[derive(Debug, Clone)]
pub struct IpPacket<'a> {
    family: Option<u32>,
    header: &'a [u8],
    payload: &'a [u8],
    pub version: u8,
    pub protocol: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl<'a> IpPacket<'a> {
    /// Parse a packet, stripping the address-family prefix if `framing` says
    /// there is one. Truncated input is an error, never a panic.
    pub fn parse(data: &'a [u8], framing: Framing) -> Result<Self> {
        let (family, data) = split_framing(data, framing)?;
        let Some(&first) = data.first() else {
            return Err(Error::PacketTooSmall {
                expected: IPV4_MIN_HEADER,
                actual: 0,
            });
        };

        match first >> 4 {
            4 => Self::parse_v4(family, data),
            6 => Self::parse_v6(family, data),
            v => Err(Error::IpVersion(v)),
        }
    }

    fn parse_v4(family: Option<u32>, data: &'a [u8]) -> Result<Self> {
        if data.len() < IPV4_MIN_HEADER {
            return Err(Error::PacketTooSmall {
                expected: IPV4_MIN_HEADER,
                actual: data.len(),
            });
        }
        let header_len = ((data[0] & 0x0F) as usize) * 4;
        if header_len < IPV4_MIN_HEADER {
            return Err(Error::MalformedPacket("IPv4 header length below minimum"));
        }
        if data.len() < header_len {
            return Err(Error::PacketTooSmall {
                expected: header_len,
                actual: data.len(),
            });
        }

        let src: [u8; 4] = data[12..16].try_into().map_err(|_| Error::MalformedPacket("source"))?;
        let dst: [u8; 4] = data[16..20].try_into().map_err(|_| Error::MalformedPacket("destination"))?;

        Ok(Self {
            family,
            header: &data[..header_len],
            payload: &data[header_len..],
            version: 4,
            protocol: data[9],
            src: IpAddr::V4(Ipv4Addr::from(src)),
            dst: IpAddr::V4(Ipv4Addr::from(dst)),
        })
    }

    fn parse_v6(family: Option<u32>, data: &'a [u8]) -> Result<Self> {
        if data.len() < IPV6_HEADER {
            return Err(Error::PacketTooSmall {
                expected: IPV6_HEADER,
                actual: data.len(),
            });
        }

        let src: [u8; 16] = data[8..24].try_into().map_err(|_| Error::MalformedPacket("source"))?;
        let dst: [u8; 16] = data[24..40].try_into().map_err(|_| Error::MalformedPacket("destination"))?;
        let (protocol, header_len) = skip_v6_extensions(data)?;

        Ok(Self {
            family,
            header: &data[..header_len],
            payload: &data[header_len..],
            version: 6,
            protocol,
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
        })
    }

    /// Serialize back to wire bytes, re-emitting the framing seen on input.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.header.len() + self.payload.len());
        if let Some(family) = self.family {
            out.extend_from_slice(&family.to_be_bytes());
        }
        out.extend_from_slice(self.header);
        out.extend_from_slice(self.payload);
        out
    }

    /// Address family prefix, when the packet was framed with one.
    pub fn family_prefix(&self) -> Option<u32> {
        self.family
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn transport(&self) -> Transport {
        Transport::from_protocol(self.protocol)
    }

    /// Source and destination ports of a TCP or UDP packet.
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.transport() {
            Transport::Tcp | Transport::Udp if self.payload.len() >= 4 => Some((
                u16::from_be_bytes([self.payload[0], self.payload[1]]),
                u16::from_be_bytes([self.payload[2], self.payload[3]]),
            )),
            _ => None,
        }
    }

    /// DNS traffic in either direction: queries go to port 53, answers come
    /// from it.
    pub fn is_dns(&self) -> bool {
        self.ports()
            .is_some_and(|(src, dst)| src == DNS_PORT || dst == DNS_PORT)
    }

    /// The DNS message carried by this packet.
    pub fn dns_message(&self) -> Result<&'a [u8]> {
        if !self.is_dns() {
            return Err(Error::NotDns);
        }
        let payload = self.payload;

        match self.transport() {
            Transport::Udp => {
                if payload.len() < UDP_HEADER {
                    return Err(Error::MalformedPacket("UDP header truncated"));
                }
                Ok(&payload[UDP_HEADER..])
            }
            Transport::Tcp => {
                if payload.len() < TCP_MIN_HEADER {
                    return Err(Error::MalformedPacket("TCP header truncated"));
                }
                let header_len = ((payload[12] >> 4) as usize) * 4;
                if header_len < TCP_MIN_HEADER || header_len > payload.len() {
                    return Err(Error::MalformedPacket("invalid TCP header length"));
                }
                if payload.len() < header_len + 2 {
                    return Err(Error::MalformedPacket("missing DNS length prefix"));
                }
                let dns_len =
                    u16::from_be_bytes([payload[header_len], payload[header_len + 1]]) as usize;
                let start = header_len + 2;
                let end = start + dns_len;
                if end > payload.len() {
                    return Err(Error::MalformedPacket("truncated DNS message in TCP segment"));
                }
                Ok(&payload[start..end])
            }
            Transport::Other(_) => Err(Error::NotDns),
        }
    }

    /// Every question name of the DNS message in this packet.
    pub fn dns_query_names(&self) -> Result<Vec<String>> {
        dns::question_names(self.dns_message()?)
    }

    /// Derive the flow descriptor used for classification.
    pub fn flow(&self) -> Flow {
        let (src_port, dst_port) = self.ports().unwrap_or((0, 0));
        let dns_mode = self.is_dns();
        let dns_questions = if dns_mode {
            self.dns_query_names().unwrap_or_default()
        } else {
            Vec::new()
        };

        Flow {
            src_ip: self.src,
            dst_ip: self.dst,
            src_port,
            dst_port,
            transport: self.transport(),
            host: None,
            dns_mode,
            dns_questions,
        }
    }
}

fn split_framing(data: &[u8], framing: Framing) -> Result<(Option<u32>, &[u8])> {
    let prefixed = match framing {
        Framing::Raw => false,
        Framing::AfPrefix => true,
        Framing::Auto => !matches!(data.first().map(|b| b >> 4), Some(4) | Some(6)),
    };
    if !prefixed {
        return Ok((None, data));
    }
    if data.len() < 4 {
        return Err(Error::PacketTooSmall {
            expected: 4,
            actual: data.len(),
        });
    }
    let family = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Ok((Some(family), &data[4..]))
}

/// One classified unit of traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: Transport,
    /// Hostname the flow is known to target, if any.
    pub host: Option<String>,
    /// Set when the flow itself is DNS traffic.
    pub dns_mode: bool,
    /// Question names when the flow carries a DNS message.
    pub dns_questions: Vec<String>,
}

impl Flow {
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, transport: Transport) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            transport,
            host: None,
            dns_mode: false,
            dns_questions: Vec::new(),
        }
    }

    pub fn with_ports(mut self, src_port: u16, dst_port: u16) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_dns_questions(mut self, names: Vec<String>) -> Self {
        self.dns_mode = true;
        self.dns_questions = names;
        self
    }

    /// The non-empty hostname of this flow.
    pub fn hostname(&self) -> Option<&str> {
        self.host.as_deref().filter(|h| !h.is_empty())
    }
}

/// Walk the IPv6 extension header chain and return the upper-layer protocol
/// with the offset where its header starts.
///
/// A non-first fragment carries no upper-layer header, so it is reported as
/// the fragment header itself and yields no ports.
fn skip_v6_extensions(data: &[u8]) -> Result<(u8, usize)> {
    let mut next = data[6];
    let mut offset = IPV6_HEADER;
    loop {
        if !matches!(next, EXT_HOP_BY_HOP | EXT_ROUTING | EXT_FRAGMENT | EXT_AUTH | EXT_DEST_OPTS) {
            return Ok((next, offset));
        }
        let fixed = data
            .get(offset..offset + 8)
            .ok_or(Error::MalformedPacket("truncated IPv6 extension header"))?;
        let len = match next {
            EXT_AUTH => (usize::from(fixed[1]) + 2) * 4,
            EXT_FRAGMENT => {
                if u16::from_be_bytes([fixed[2], fixed[3]]) >> 3 != 0 {
                    return Ok((EXT_FRAGMENT, offset));
                }
                8
            }
            _ => (usize::from(fixed[1]) + 1) * 8,
        };
        if data.len() < offset + len {
            return Err(Error::MalformedPacket("truncated IPv6 extension header"));
        }
        next = fixed[0];
        offset += len;
    }
}
