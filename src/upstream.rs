//! DNS upstream transports.
//!
//! Each [`Upstream`] performs one query/answer exchange over plain UDP, plain
//! TCP (length-prefixed) or DNS-over-HTTPS, optionally through a SOCKS5
//! proxy. Every exchange is bounded by the per-attempt timeout.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

use crate::config::{DnsConfig, UpstreamMode};
use crate::error::{Error, Result};
use crate::socks5::UdpAssociation;
use crate::transport::MAX_DNS_PACKET_SIZE;

const DNS_PORT: u16 = 53;
const DNS_MESSAGE: &str = "application/dns-message";

/// One upstream resolver reachable over one transport.
#[derive(Clone)]
pub enum Upstream {
    Udp {
        server: SocketAddr,
        socks5: Option<SocketAddr>,
    },
    Tcp {
        server: SocketAddr,
        socks5: Option<SocketAddr>,
    },
    Doh {
        url: String,
        client: reqwest::Client,
    },
}

impl Upstream {
    pub fn doh(host: &str, socks5: Option<SocketAddr>, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = socks5 {
            builder = builder.proxy(reqwest::Proxy::all(format!("socks5h://{proxy}"))?);
        }
        Ok(Upstream::Doh {
            url: format!("https://{host}/dns-query"),
            client: builder.build()?,
        })
    }

    /// Short description for logs: `udp://8.8.8.8:53`.
    pub fn label(&self) -> String {
        self.to_string()
    }

    /// Send `query` and wait for the raw answer, at most `timeout`.
    pub async fn exchange(&self, query: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let attempt = async {
            match self {
                Upstream::Udp { server, socks5: None } => exchange_udp(*server, query).await,
                Upstream::Udp {
                    server,
                    socks5: Some(proxy),
                } => exchange_udp_socks5(*proxy, *server, query).await,
                Upstream::Tcp { server, socks5 } => exchange_tcp(*server, *socks5, query).await,
                Upstream::Doh { url, client } => exchange_doh(client, url, query).await,
            }
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                upstream: self.label(),
                timeout,
            }),
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::Udp { server, socks5 } => write!(f, "udp://{server}{}", via(socks5)),
            Upstream::Tcp { server, socks5 } => write!(f, "tcp://{server}{}", via(socks5)),
            Upstream::Doh { url, .. } => f.write_str(url),
        }
    }
}

fn via(socks5: &Option<SocketAddr>) -> String {
    socks5.map(|p| format!(" via socks5://{p}")).unwrap_or_default()
}

async fn exchange_udp(server: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    let n = socket.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

async fn exchange_udp_socks5(proxy: SocketAddr, server: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let association = UdpAssociation::open(proxy).await?;
    association.send_to(query, server).await?;

    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    let (n, from) = association.recv_from(&mut buf).await?;
    trace!(%from, len = n, "SOCKS5 relay answered");
    buf.truncate(n);
    Ok(buf)
}

async fn exchange_tcp(server: SocketAddr, socks5: Option<SocketAddr>, query: &[u8]) -> Result<Vec<u8>> {
    let mut stream = match socks5 {
        Some(proxy) => tokio_socks::tcp::Socks5Stream::connect(proxy, server)
            .await?
            .into_inner(),
        None => TcpStream::connect(server).await?,
    };

    let len = u16::try_from(query.len()).map_err(|_| Error::MalformedDns("query too large for TCP"))?;
    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await?;

    let len = stream.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn exchange_doh(client: &reqwest::Client, url: &str, query: &[u8]) -> Result<Vec<u8>> {
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE)
        .header(reqwest::header::ACCEPT, DNS_MESSAGE)
        .body(query.to_vec())
        .send()
        .await?
        .error_for_status()?;

    Ok(response.bytes().await?.to_vec())
}

/// Parse `8.8.8.8`, `8.8.8.8:5353` or `[2001:4860::8888]:53`.
pub fn parse_server(server: &str) -> Result<SocketAddr> {
    server
        .parse::<SocketAddr>()
        .or_else(|_| server.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
        .map_err(|_| Error::Config(format!("invalid DNS server address: {server}")))
}

/// Every upstream the DNS section asks for: each server over each enabled
/// plain transport, then each DoH host.
pub fn from_config(config: &DnsConfig) -> Result<Vec<Upstream>> {
    let servers = config
        .servers
        .iter()
        .map(|s| parse_server(s))
        .collect::<Result<Vec<_>>>()?;
    let socks5 = config.socks5;
    let mut upstreams = Vec::new();

    for server in &servers {
        if config.modes.contains(&UpstreamMode::Tcp) {
            upstreams.push(Upstream::Tcp {
                server: *server,
                socks5,
            });
        }
        if config.modes.contains(&UpstreamMode::Udp) {
            upstreams.push(Upstream::Udp {
                server: *server,
                socks5,
            });
        }
    }

    if config.modes.contains(&UpstreamMode::Doh) {
        for host in config.effective_doh_hosts() {
            upstreams.push(Upstream::doh(host, socks5, config.attempt_timeout())?);
        }
    }

    if upstreams.is_empty() {
        return Err(Error::Config("no DNS upstream configured".into()));
    }
    Ok(upstreams)
}
