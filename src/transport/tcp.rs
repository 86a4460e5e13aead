//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently and may carry several
//! queries in a row. TCP DNS messages are prefixed with a 2-byte length.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch::DispatchQueue;
use crate::dns::HEADER_LEN;
use crate::resolver::{DnsJob, ReplyTo};

/// Idle connections are closed after this long without a query.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP listener feeding the resolver.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop; every connection gets its own task.
    pub fn start(self, queue: DispatchQueue<DnsJob>) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, queue))
    }
}

async fn run_accept_loop(listener: TcpListener, queue: DispatchQueue<DnsJob>) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                let queue = queue.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(client, queue).await {
                        debug!(%peer, error = %e, "TCP DNS connection ended");
                    }
                });
            }
            Err(e) => warn!(error = %e, "TCP accept error"),
        }
    }
}

async fn handle_connection(mut client: TcpStream, queue: DispatchQueue<DnsJob>) -> io::Result<()> {
    while let Some(query) = read_dns_message(&mut client).await? {
        let (tx, rx) = oneshot::channel();
        if queue
            .submit(DnsJob {
                query,
                reply: ReplyTo::Channel(tx),
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        // A dropped sender means the query went unanswered; close like a
        // timed-out server would.
        let Ok(answer) = rx.await else {
            return Ok(());
        };
        write_dns_message(&mut client, &answer).await?;
    }
    Ok(())
}

/// Read one length-prefixed DNS message, `None` on a clean close or idle timeout.
async fn read_dns_message(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let len = match tokio::time::timeout(IDLE_TIMEOUT, stream.read_u16()).await {
        Ok(Ok(len)) => len as usize,
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Ok(None),
    };
    if len < HEADER_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "DNS message shorter than header"));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_dns_message(stream: &mut TcpStream, message: &[u8]) -> io::Result<()> {
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DNS message too large"))?;
    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await
}
