//! DNS query resolution.
//!
//! Handles the query pipeline for the DNS listener:
//! 1. Serve a cached answer when one is young enough
//! 2. Race every upstream when nothing usable is cached or a refresh is due
//! 3. Feed the winning answer back into the classifier
//!
//! Transports handle the socket I/O and hand queries over as [`DnsJob`]s
//! through a [`DispatchQueue`], which caps how many queries are in flight.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::classifier::Classifier;
use crate::config::DnsConfig;
use crate::dispatch::DispatchQueue;
use crate::dns::Message;
use crate::error::{Error, Result};
use crate::stats::Stats;
use crate::upstream::{self, Upstream};

/// Where the answer to a query goes.
pub enum ReplyTo {
    /// Send a datagram back through the listening socket.
    Udp { socket: Arc<UdpSocket>, peer: SocketAddr },
    /// Hand the answer to whoever holds the receiver (TCP connections, tests).
    Channel(oneshot::Sender<Vec<u8>>),
}

impl ReplyTo {
    async fn send(self, answer: Vec<u8>) {
        match self {
            ReplyTo::Udp { socket, peer } => {
                if let Err(e) = socket.send_to(&answer, peer).await {
                    warn!(%peer, error = %e, "failed to send DNS answer");
                }
            }
            ReplyTo::Channel(tx) => {
                let _ = tx.send(answer);
            }
        }
    }
}

/// One query waiting for resolution.
pub struct DnsJob {
    pub query: Vec<u8>,
    pub reply: ReplyTo,
}

/// Resolver handles DNS query processing: cache, upstream race, absorption.
pub struct Resolver {
    classifier: Arc<Classifier>,
    upstreams: Arc<[Upstream]>,
    attempt_timeout: Duration,
    query_timeout: Duration,
    stats: Stats,
}

impl Resolver {
    pub fn new(
        classifier: Arc<Classifier>,
        upstreams: Vec<Upstream>,
        attempt_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            upstreams: upstreams.into(),
            attempt_timeout,
            query_timeout,
            stats: Stats::new(),
        }
    }

    pub fn from_config(classifier: Arc<Classifier>, config: &DnsConfig) -> Result<Self> {
        Ok(Self::new(
            classifier,
            upstream::from_config(config)?,
            config.attempt_timeout(),
            config.query_timeout(),
        ))
    }

    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Dispatch queue running [`Resolver::process`] with at most `capacity`
    /// queries in flight.
    pub fn dispatch_queue(self: &Arc<Self>, capacity: usize) -> DispatchQueue<DnsJob> {
        let resolver = Arc::clone(self);
        DispatchQueue::new(capacity, move |job| {
            let resolver = Arc::clone(&resolver);
            async move { resolver.process(job).await }
        })
    }

    /// Answer one query.
    ///
    /// A cached answer is sent right away. When it is fresh nothing else
    /// happens besides refreshing the snoop map; when it is stale the
    /// upstream race still runs to refresh the cache. Without any answer in
    /// time the query is dropped.
    pub async fn process(&self, job: DnsJob) {
        let start = Instant::now();
        let DnsJob { query, reply } = job;
        let mut reply = Some(reply);

        if let Some(cached) = self.classifier.lookup_cached_answer(&query) {
            if let Some(reply) = reply.take() {
                reply.send(cached.response.clone()).await;
            }
            self.stats.record_cached(cached.should_refresh, start.elapsed());
            if !cached.should_refresh {
                self.classifier.snoop_dns_answer(&cached.response);
                return;
            }
            trace!("serving stale answer, refreshing");
        }

        let query: Arc<[u8]> = query.into();
        match self.race(&query).await {
            Some((answer, upstream)) => {
                debug!(%upstream, elapsed_ms = start.elapsed().as_secs_f64() * 1000.0, "upstream answered");
                let classifier = Arc::clone(&self.classifier);
                let absorbed = answer.clone();
                tokio::task::spawn_blocking(move || classifier.absorb_dns_answer(&absorbed));

                if let Some(reply) = reply {
                    reply.send(answer).await;
                    self.stats.record_forwarded(start.elapsed());
                }
            }
            None if reply.is_some() => {
                debug!(timeout = ?self.query_timeout, "no upstream answered, dropping query");
                self.stats.record_dropped();
            }
            None => {}
        }
    }

    /// Query every upstream at once and return the first usable answer.
    /// Losing attempts keep running in the background; their results are
    /// discarded.
    async fn race(&self, query: &Arc<[u8]>) -> Option<(Vec<u8>, String)> {
        let query_id = Message::parse(query).ok()?.id;

        let mut attempts: FuturesUnordered<_> = self
            .upstreams
            .iter()
            .cloned()
            .map(|upstream| {
                let query = Arc::clone(query);
                let timeout = self.attempt_timeout;
                tokio::spawn(async move {
                    let result = upstream.exchange(&query, timeout).await;
                    (upstream.label(), result)
                })
            })
            .collect();

        let first_usable = async {
            while let Some(joined) = attempts.next().await {
                let Ok((upstream, result)) = joined else {
                    continue;
                };
                match result.and_then(|answer| check_answer(&upstream, query_id, answer)) {
                    Ok(answer) => return Some((answer, upstream)),
                    Err(e) => debug!(%upstream, error = %e, "upstream attempt failed"),
                }
            }
            None
        };

        tokio::time::timeout(self.query_timeout, first_usable)
            .await
            .ok()
            .flatten()
    }
}

/// Accept only a parsable response to this query with at least one answer.
fn check_answer(upstream: &str, query_id: u16, answer: Vec<u8>) -> Result<Vec<u8>> {
    let bad = || Error::BadAnswer {
        upstream: upstream.to_string(),
    };
    let message = Message::parse(&answer).map_err(|_| bad())?;
    if !message.is_response() || message.id != query_id || message.answers.is_empty() {
        return Err(bad());
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AnswerCache;
    use crate::dns::TYPE_A;
    use crate::testutil;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    const IP: &str = "93.184.216.34";

    /// UDP upstream answering every query for its question name with `ips`.
    async fn mock_upstream(ips: Vec<IpAddr>) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let query = Message::parse(&buf[..n]).unwrap();
                let name = &query.questions[0].name;
                let answer = testutil::dns_answer(query.id, name, &ips);
                let _ = socket.send_to(&answer, peer).await;
            }
        });

        (addr, hits)
    }

    fn resolver(classifier: Arc<Classifier>, servers: &[SocketAddr]) -> Resolver {
        let upstreams = servers
            .iter()
            .map(|server| Upstream::Udp {
                server: *server,
                socks5: None,
            })
            .collect();
        Resolver::new(classifier, upstreams, Duration::from_millis(200), Duration::from_millis(400))
    }

    async fn ask(resolver: &Resolver, id: u16, name: &str) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        resolver
            .process(DnsJob {
                query: testutil::dns_query(id, name, TYPE_A),
                reply: ReplyTo::Channel(tx),
            })
            .await;
        rx.await.ok()
    }

    async fn wait_for_cache(classifier: &Classifier, len: usize) {
        for _ in 0..100 {
            if classifier.answer_cache().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("answer never reached the cache");
    }

    #[tokio::test]
    async fn forwards_then_serves_from_cache() {
        let (server, hits) = mock_upstream(vec![IP.parse().unwrap()]).await;
        let classifier = Arc::new(Classifier::new(Vec::new()));
        let resolver = resolver(classifier.clone(), &[server]);

        let answer = ask(&resolver, 1, "example.com").await.unwrap();
        assert_eq!(Message::parse(&answer).unwrap().id, 1);
        wait_for_cache(&classifier, 1).await;
        assert_eq!(classifier.snooped_host(IP.parse().unwrap()).as_deref(), Some("example.com"));

        let answer = ask(&resolver, 2, "example.com").await.unwrap();
        assert_eq!(Message::parse(&answer).unwrap().id, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let snap = resolver.stats().snapshot_and_reset();
        assert_eq!((snap.forwarded, snap.cached, snap.stale), (1, 1, 0));
    }

    #[tokio::test]
    async fn stale_answer_is_served_and_refreshed() {
        let (server, hits) = mock_upstream(vec!["1.1.1.1".parse().unwrap()]).await;
        let interval = Duration::from_secs(60);
        let classifier = Arc::new(Classifier::with_answer_cache(Vec::new(), AnswerCache::new(16), interval));
        let captured = SystemTime::now() - interval * 3 / 2;
        classifier.absorb_dns_answer_at(&testutil::dns_answer(9, "example.com", &[IP.parse().unwrap()]), captured);
        let resolver = resolver(classifier.clone(), &[server]);

        let answer = ask(&resolver, 3, "example.com").await.unwrap();
        let addresses: Vec<IpAddr> = Message::parse(&answer).unwrap().addresses().collect();
        assert_eq!(addresses, vec![IP.parse::<IpAddr>().unwrap()]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let probe = testutil::dns_query(4, "example.com", TYPE_A);
        let mut refreshed = false;
        for _ in 0..100 {
            if classifier.lookup_cached_answer(&probe).is_some_and(|c| !c.should_refresh) {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(refreshed);
        assert_eq!(classifier.snooped_host("1.1.1.1".parse().unwrap()).as_deref(), Some("example.com"));
        assert_eq!(resolver.stats().snapshot_and_reset().stale, 1);
    }

    #[tokio::test]
    async fn empty_answers_lose_the_race() {
        let (empty, _) = mock_upstream(Vec::new()).await;
        let (full, _) = mock_upstream(vec![IP.parse().unwrap()]).await;
        let resolver = resolver(Arc::new(Classifier::new(Vec::new())), &[empty, full]);

        let answer = ask(&resolver, 5, "example.com").await.unwrap();
        assert_eq!(Message::parse(&answer).unwrap().answers.len(), 1);
    }

    #[tokio::test]
    async fn query_is_dropped_when_nobody_answers() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = resolver(Arc::new(Classifier::new(Vec::new())), &[silent.local_addr().unwrap()]);

        assert!(ask(&resolver, 6, "example.com").await.is_none());
        assert_eq!(resolver.stats().snapshot_and_reset().dropped, 1);
    }

    #[tokio::test]
    async fn dispatch_queue_answers_udp_peer() {
        let (server, _) = mock_upstream(vec![IP.parse().unwrap()]).await;
        let resolver = Arc::new(resolver(Arc::new(Classifier::new(Vec::new())), &[server]));
        let queue = resolver.dispatch_queue(4);

        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        queue
            .submit(DnsJob {
                query: testutil::dns_query(7, "example.com", TYPE_A),
                reply: ReplyTo::Udp {
                    socket: listener,
                    peer: client.local_addr().unwrap(),
                },
            })
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::parse(&buf[..n]).unwrap().id, 7);
    }

    #[test]
    fn check_answer_rejects_mismatched_id() {
        let answer = testutil::dns_answer(1, "example.com", &[IP.parse().unwrap()]);

        assert!(check_answer("u", 1, answer.clone()).is_ok());
        assert!(check_answer("u", 2, answer).is_err());
        assert!(check_answer("u", 1, testutil::dns_query(1, "example.com", TYPE_A)).is_err());
    }
}
