//! UDP transport for DNS queries.
//!
//! One receive loop reads datagrams and queues them; the answer is sent
//! straight back to the datagram's source from the same socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch::DispatchQueue;
use crate::dns::HEADER_LEN;
use crate::resolver::{DnsJob, ReplyTo};

use super::MAX_DNS_PACKET_SIZE;

/// UDP listener feeding the resolver.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: Arc::new(UdpSocket::bind(addr).await?),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the receive loop. It ends when the dispatch queue closes.
    pub fn start(self, queue: DispatchQueue<DnsJob>) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, queue))
    }
}

async fn run(socket: Arc<UdpSocket>, queue: DispatchQueue<DnsJob>) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP recv error");
                continue;
            }
        };

        if len < HEADER_LEN {
            debug!(%peer, len, "ignoring runt DNS datagram");
            continue;
        }

        let job = DnsJob {
            query: buf[..len].to_vec(),
            reply: ReplyTo::Udp {
                socket: socket.clone(),
                peer,
            },
        };
        if queue.submit(job).await.is_err() {
            debug!("dispatch queue closed, stopping UDP listener");
            return;
        }
    }
}
