//! DNS listener transports.
//!
//! Both transports only move bytes: every query becomes a
//! [`DnsJob`](crate::resolver::DnsJob) submitted to the resolver's dispatch
//! queue, which applies backpressure when too many queries are in flight.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
