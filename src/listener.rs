//! DNS listener orchestration.
//!
//! Binds the UDP and TCP transports, wires them to the resolver through one
//! dispatch queue and runs the periodic jobs: stats logging and disk cache
//! pruning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::DiskStore;
use crate::config::DnsConfig;
use crate::error::Result;
use crate::resolver::Resolver;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Running DNS listener. Dropping it stops every task it spawned.
pub struct Listener {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Listener {
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Start the DNS listener on `config.listen`.
///
/// With caching disabled the cache directory is removed up front.
pub async fn start(config: &DnsConfig, resolver: Arc<Resolver>) -> Result<Listener> {
    if !config.cache {
        DiskStore::new(&config.cache_dir, config.disk_budget_bytes).clear()?;
    }

    let udp = UdpTransport::bind(config.listen).await?;
    let udp_addr = udp.local_addr()?;
    // Follow an ephemeral UDP port so both transports share one address.
    let tcp = TcpTransport::bind(udp_addr).await?;
    let tcp_addr = tcp.local_addr()?;

    let upstreams: Vec<String> = resolver.upstreams().iter().map(|u| u.label()).collect();
    info!(%udp_addr, upstreams = %upstreams.join(", "), "DNS listener started");

    let queue = resolver.dispatch_queue(config.max_concurrent);
    let mut tasks = vec![udp.start(queue.clone()), tcp.start(queue)];
    tasks.push(tokio::spawn(report_stats(resolver.clone())));
    if config.cache {
        tasks.push(tokio::spawn(prune_disk_cache(resolver, config.cache_interval())));
    }

    Ok(Listener {
        udp_addr,
        tcp_addr,
        tasks,
    })
}

async fn report_stats(resolver: Arc<Resolver>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let stats = resolver.stats().snapshot_and_reset();
        info!(
            uptime_secs = stats.uptime_secs,
            cache = resolver.classifier().answer_cache().len(),
            requests = stats.requests,
            forwarded = stats.forwarded,
            cached = stats.cached,
            stale = stats.stale,
            dropped = stats.dropped,
            avg_response_ms = format_args!("{:.2}", stats.avg_response_ms),
            "DNS stats"
        );
    }
}

async fn prune_disk_cache(resolver: Arc<Resolver>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let resolver = resolver.clone();
        let pruned = tokio::task::spawn_blocking(move || {
            resolver.classifier().answer_cache().disk().map(DiskStore::prune)
        })
        .await;

        match pruned {
            Ok(Some(Ok(removed))) if removed > 0 => debug!(removed, "pruned DNS cache files"),
            Ok(Some(Err(e))) => warn!(error = %e, "DNS cache pruning failed"),
            Err(e) => warn!(error = %e, "DNS cache pruning task failed"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::dns::{Message, TYPE_A};
    use crate::testutil;
    use crate::upstream::Upstream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UdpSocket};

    async fn mock_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let query = Message::parse(&buf[..n]).unwrap();
                let answer = testutil::dns_answer(query.id, &query.questions[0].name, &["10.1.2.3".parse().unwrap()]);
                let _ = socket.send_to(&answer, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn answers_over_udp_and_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let config = DnsConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            cache: false,
            cache_dir: dir.path().join("dns"),
            ..DnsConfig::default()
        };
        let upstream = Upstream::Udp {
            server: mock_upstream().await,
            socks5: None,
        };
        let resolver = Arc::new(Resolver::new(
            Arc::new(Classifier::new(Vec::new())),
            vec![upstream],
            Duration::from_secs(1),
            Duration::from_secs(2),
        ));
        let listener = start(&config, resolver).await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&testutil::dns_query(11, "example.com", TYPE_A), listener.udp_addr())
            .await
            .unwrap();
        let mut buf = [0u8; 512];
        let n = client.recv(&mut buf).await.unwrap();
        assert_eq!(Message::parse(&buf[..n]).unwrap().id, 11);

        let query = testutil::dns_query(12, "example.org", TYPE_A);
        let mut stream = TcpStream::connect(listener.tcp_addr()).await.unwrap();
        stream.write_u16(query.len() as u16).await.unwrap();
        stream.write_all(&query).await.unwrap();
        let len = stream.read_u16().await.unwrap() as usize;
        let mut answer = vec![0u8; len];
        stream.read_exact(&mut answer).await.unwrap();
        assert_eq!(Message::parse(&answer).unwrap().id, 12);
    }

    #[tokio::test]
    async fn disabled_cache_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("dns");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join("old_1.d"), b"x").unwrap();
        let config = DnsConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            cache: false,
            cache_dir: cache_dir.clone(),
            ..DnsConfig::default()
        };
        let resolver = Arc::new(Resolver::new(
            Arc::new(Classifier::new(Vec::new())),
            Vec::new(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));

        let _listener = start(&config, resolver).await.unwrap();
        assert!(!cache_dir.exists());
    }
}
