//! Wire-format builders shared by unit tests.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::dns::{TYPE_A, TYPE_AAAA};

fn encode_name(buf: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

fn header(id: u16, flags: u16, qdcount: u16, ancount: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(512);
    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&flags.to_be_bytes());
    data.extend_from_slice(&qdcount.to_be_bytes());
    data.extend_from_slice(&ancount.to_be_bytes());
    data.extend_from_slice(&[0, 0, 0, 0]);
    data
}

pub fn dns_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut data = header(id, 0x0100, 1, 0);
    encode_name(&mut data, name);
    data.extend_from_slice(&qtype.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes());
    data
}

pub fn dns_query_multi(id: u16, names: &[&str]) -> Vec<u8> {
    let mut data = header(id, 0x0100, names.len() as u16, 0);
    for name in names {
        encode_name(&mut data, name);
        data.extend_from_slice(&TYPE_A.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
    }
    data
}

/// A response for `name` whose answers point back at the question name.
pub fn dns_answer(id: u16, name: &str, ips: &[IpAddr]) -> Vec<u8> {
    let qtype = match ips.first() {
        Some(IpAddr::V6(_)) => TYPE_AAAA,
        _ => TYPE_A,
    };
    let mut data = header(id, 0x8180, 1, ips.len() as u16);
    encode_name(&mut data, name);
    data.extend_from_slice(&qtype.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes());

    for ip in ips {
        data.extend_from_slice(&[0xC0, 0x0C]);
        let rdata = match ip {
            IpAddr::V4(v4) => {
                data.extend_from_slice(&TYPE_A.to_be_bytes());
                v4.octets().to_vec()
            }
            IpAddr::V6(v6) => {
                data.extend_from_slice(&TYPE_AAAA.to_be_bytes());
                v6.octets().to_vec()
            }
        };
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&300u32.to_be_bytes());
        data.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        data.extend_from_slice(&rdata);
    }
    data
}

/// IPv4 packet with a UDP datagram carrying `payload`.
pub fn ipv4_udp(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut udp = Vec::with_capacity(8 + payload.len());
    udp.extend_from_slice(&sport.to_be_bytes());
    udp.extend_from_slice(&dport.to_be_bytes());
    udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    ipv4(17, src, dst, &udp)
}

/// IPv4 packet with a TCP segment carrying a length-prefixed `dns` message.
pub fn ipv4_tcp_dns(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, dns: &[u8]) -> Vec<u8> {
    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&sport.to_be_bytes());
    tcp[2..4].copy_from_slice(&dport.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp.extend_from_slice(&(dns.len() as u16).to_be_bytes());
    tcp.extend_from_slice(dns);
    ipv4(6, src, dst, &tcp)
}

pub fn ipv4(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&0x1c46u16.to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[10..12].copy_from_slice(&0xb1e6u16.to_be_bytes());
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet.extend_from_slice(payload);
    packet
}

pub fn ipv6_udp(src: Ipv6Addr, sport: u16, dst: Ipv6Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 40];
    packet[0] = 0x60;
    packet[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    packet[6] = 17;
    packet[7] = 64;
    packet[8..24].copy_from_slice(&src.octets());
    packet[24..40].copy_from_slice(&dst.octets());
    packet.extend_from_slice(&sport.to_be_bytes());
    packet.extend_from_slice(&dport.to_be_bytes());
    packet.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(payload);
    packet
}

/// Prepend the 4-byte address-family header some platforms put on tun reads.
pub fn with_af_prefix(family: u32, packet: &[u8]) -> Vec<u8> {
    let mut framed = family.to_be_bytes().to_vec();
    framed.extend_from_slice(packet);
    framed
}
