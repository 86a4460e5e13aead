//! Demultiplexer session.
//!
//! A session moves through `Idle -> Configured -> Running -> Closed`.
//! Configuring creates one [`VirtualChannel`] per target plus the default
//! channel. Running starts:
//!
//! - one tunnel reader that classifies every packet and hands it to the
//!   matching channel, or the default channel when nothing matches or the
//!   packet does not parse;
//! - one reader per channel that feeds DNS answers to the classifier in the
//!   background and queues the packet for the tunnel;
//! - a single tunnel writer draining that queue, so packets from different
//!   channels are never interleaved mid-write.

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::capture::PacketSink;
use crate::classifier::Classifier;
use crate::dispatch::DispatchQueue;
use crate::error::{Error, Result};
use crate::packet::{Framing, IpPacket};

use super::channel::VirtualChannel;
use super::device::TunDevice;

/// Name of the fallback channel.
pub const DEFAULT_CHANNEL: &str = "default";

/// Tunnel writer queue slots per channel.
const WRITE_QUEUE_PER_CHANNEL: usize = 10;
const ABSORB_QUEUE: usize = 256;
const ABSORB_CONCURRENCY: usize = 8;
const CAPTURE_QUEUE: usize = 1024;
/// Room for an address-family prefix on top of the MTU.
const FRAMING_HEADROOM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Running,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-side descriptors of every channel, keyed by target name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMap {
    pub default_fd: RawFd,
    pub proxy_fd: BTreeMap<String, RawFd>,
}

impl ChannelMap {
    /// `{"default_fd":..,"proxy_fd":{..}}`, or an empty string if encoding fails.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Picks the channel for each packet read from the tunnel.
#[derive(Clone)]
struct Router {
    classifier: Arc<Classifier>,
    framing: Framing,
    default: Arc<VirtualChannel>,
    channels: Arc<FxHashMap<Arc<str>, Arc<VirtualChannel>>>,
}

impl Router {
    fn route(&self, packet: &[u8]) -> &Arc<VirtualChannel> {
        let parsed = match IpPacket::parse(packet, self.framing) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(error = %e, "unparsable packet goes to default channel");
                return &self.default;
            }
        };

        let target = self.classifier.classify_packet(&parsed);
        let channel = target
            .as_ref()
            .and_then(|t| self.channels.get(t))
            .unwrap_or(&self.default);
        debug!(dst = %parsed.dst, target = channel.name(), "routed packet");
        channel
    }
}

pub struct Session {
    classifier: Arc<Classifier>,
    capture: Option<Arc<dyn PacketSink>>,
    state: SessionState,
    default: Option<Arc<VirtualChannel>>,
    channels: FxHashMap<Arc<str>, Arc<VirtualChannel>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn new(classifier: Arc<Classifier>) -> Self {
        Self {
            classifier,
            capture: None,
            state: SessionState::Idle,
            default: None,
            channels: FxHashMap::default(),
            tasks: Vec::new(),
        }
    }

    /// Mirror every tunnel packet to `sink`.
    pub fn with_capture(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.capture = Some(sink);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(Error::SessionState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Create the default channel and one channel per distinct target.
    ///
    /// If any channel cannot be created nothing is kept and the session
    /// stays idle.
    pub fn configure(&mut self, targets: &[Arc<str>]) -> Result<ChannelMap> {
        self.expect_state(SessionState::Idle)?;

        let default = Arc::new(VirtualChannel::new(DEFAULT_CHANNEL)?);
        let mut channels = FxHashMap::default();
        for target in targets {
            if target.is_empty() || target.as_ref() == DEFAULT_CHANNEL || channels.contains_key(target) {
                continue;
            }
            channels.insert(target.clone(), Arc::new(VirtualChannel::new(target.as_ref())?));
        }

        let map = ChannelMap {
            default_fd: default.host_fd(),
            proxy_fd: channels
                .iter()
                .map(|(name, channel)| (name.to_string(), channel.host_fd()))
                .collect(),
        };
        info!(channels = channels.len() + 1, "session configured");

        self.default = Some(default);
        self.channels = channels;
        self.state = SessionState::Configured;
        Ok(map)
    }

    /// [`Session::configure`] reporting the channel map as JSON, or an empty
    /// string on failure.
    pub fn configure_json(&mut self, targets: &[Arc<str>]) -> String {
        match self.configure(targets) {
            Ok(map) => map.to_json(),
            Err(e) => {
                warn!(error = %e, "session configuration failed");
                String::new()
            }
        }
    }

    /// Start moving packets between `tun` and the channels.
    pub fn run(&mut self, tun: TunDevice, mtu: usize, framing: Framing) -> Result<()> {
        self.expect_state(SessionState::Configured)?;
        let Some(default) = self.default.clone() else {
            return Err(Error::SessionState {
                expected: SessionState::Configured.as_str(),
                actual: self.state.as_str(),
            });
        };

        let tun = Arc::new(tun);
        let buffer_len = mtu + FRAMING_HEADROOM;
        let channel_count = self.channels.len() + 1;
        let (write_tx, write_rx) = mpsc::channel(channel_count * WRITE_QUEUE_PER_CHANNEL);
        let capture = self.capture.clone().map(spawn_capture);
        let absorb = self.spawn_absorber();

        self.tasks.push(tokio::spawn(write_tunnel(tun.clone(), write_rx, capture.clone())));

        let router = Router {
            classifier: self.classifier.clone(),
            framing,
            default: default.clone(),
            channels: Arc::new(self.channels.clone()),
        };
        self.tasks
            .push(tokio::spawn(read_tunnel(tun, router, buffer_len, capture)));

        for channel in std::iter::once(default).chain(self.channels.values().cloned()) {
            let reader = read_channel(channel, buffer_len, framing, write_tx.clone(), absorb.clone());
            self.tasks.push(tokio::spawn(reader));
        }

        self.state = SessionState::Running;
        info!(mtu, ?framing, "session running");
        Ok(())
    }

    /// DNS answers seen on channels are queued here and absorbed off the
    /// forwarding path.
    fn spawn_absorber(&mut self) -> mpsc::Sender<Vec<u8>> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(ABSORB_QUEUE);
        let classifier = self.classifier.clone();
        let queue = DispatchQueue::new(ABSORB_CONCURRENCY, move |message: Vec<u8>| {
            let classifier = classifier.clone();
            async move {
                let _ = tokio::task::spawn_blocking(move || classifier.absorb_dns_answer(&message)).await;
            }
        });

        self.tasks.push(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if queue.submit(message).await.is_err() {
                    return;
                }
            }
        }));
        tx
    }

    /// Stop every task and release the channels.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.channels.clear();
        self.default = None;
        if self.state != SessionState::Closed {
            info!("session closed");
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Capture runs on a blocking thread since sinks may touch the disk.
fn spawn_capture(sink: Arc<dyn PacketSink>) -> mpsc::Sender<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CAPTURE_QUEUE);
    tokio::task::spawn_blocking(move || {
        while let Some(packet) = rx.blocking_recv() {
            sink.observe(&packet);
        }
    });
    tx
}

fn mirror(capture: &Option<mpsc::Sender<Vec<u8>>>, packet: &[u8]) {
    if let Some(tx) = capture {
        if tx.try_send(packet.to_vec()).is_err() {
            trace!("capture queue full, packet not mirrored");
        }
    }
}

async fn read_tunnel(
    tun: Arc<TunDevice>,
    router: Router,
    buffer_len: usize,
    capture: Option<mpsc::Sender<Vec<u8>>>,
) {
    let mut buf = vec![0u8; buffer_len];
    loop {
        let n = match tun.read(&mut buf).await {
            Ok(0) => {
                debug!("tunnel closed");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "tunnel read failed");
                return;
            }
        };
        let packet = &buf[..n];
        mirror(&capture, packet);

        let channel = router.route(packet);
        if let Err(e) = channel.send(packet).await {
            debug!(channel = channel.name(), error = %e, "dropped packet for channel");
        }
    }
}

async fn read_channel(
    channel: Arc<VirtualChannel>,
    buffer_len: usize,
    framing: Framing,
    writer: mpsc::Sender<Vec<u8>>,
    absorb: mpsc::Sender<Vec<u8>>,
) {
    let mut buf = vec![0u8; buffer_len];
    loop {
        let n = match channel.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!(channel = channel.name(), error = %e, "channel read failed");
                return;
            }
        };
        let packet = buf[..n].to_vec();

        if let Some(message) = dns_payload(&packet, framing) {
            if absorb.try_send(message).is_err() {
                trace!(channel = channel.name(), "absorb queue full");
            }
        }
        if writer.send(packet).await.is_err() {
            return;
        }
    }
}

async fn write_tunnel(
    tun: Arc<TunDevice>,
    mut packets: mpsc::Receiver<Vec<u8>>,
    capture: Option<mpsc::Sender<Vec<u8>>>,
) {
    while let Some(packet) = packets.recv().await {
        mirror(&capture, &packet);
        if let Err(e) = tun.write_all(&packet).await {
            warn!(error = %e, "tunnel write failed");
            return;
        }
    }
}

fn dns_payload(packet: &[u8], framing: Framing) -> Option<Vec<u8>> {
    let parsed = IpPacket::parse(packet, framing).ok()?;
    if !parsed.is_dns() {
        return None;
    }
    parsed.dns_message().ok().map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::TYPE_A;
    use crate::rule::parse_rules;
    use crate::testutil;
    use std::net::Ipv4Addr;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;

    const RULES: &str = "DOMAIN-SUFFIX,blocked.example,REJECT\n\
                         IP-CIDR,93.184.216.0/24,proxyA\n\
                         MATCH,DIRECT";

    fn session() -> Session {
        Session::new(Arc::new(Classifier::new(parse_rules(RULES.lines()).unwrap())))
    }

    fn host_end(map: &ChannelMap, name: &str, session: &Session) -> UnixDatagram {
        let channel = if name == DEFAULT_CHANNEL {
            session.default.clone().unwrap()
        } else {
            session.channels.get(name).cloned().unwrap()
        };
        assert!(name == DEFAULT_CHANNEL || map.proxy_fd.contains_key(name));
        let host = UnixDatagram::from(channel.clone_host().unwrap());
        host.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        host.set_nonblocking(false).unwrap();
        host
    }

    #[tokio::test]
    async fn state_machine_rejects_out_of_order_calls() {
        let mut session = session();
        let (ours, _theirs) = UnixDatagram::pair().unwrap();
        let tun = TunDevice::from_fd(OwnedFd::from(ours)).unwrap();

        assert!(matches!(
            session.run(tun, 1500, Framing::Raw),
            Err(Error::SessionState { expected: "configured", actual: "idle" })
        ));

        let targets = session.classifier().target_names();
        session.configure(&targets).unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        assert!(session.configure(&targets).is_err());
        assert!(session.configure_json(&targets).is_empty());

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn channel_map_lists_every_target() {
        let mut session = session();
        let targets = session.classifier().target_names();
        let json = session.configure_json(&targets);

        let map: ChannelMap = serde_json::from_str(&json).unwrap();
        let names: Vec<&str> = map.proxy_fd.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["DIRECT", "REJECT", "proxyA"]);
        assert!(map.default_fd >= 0);
        assert!(json.starts_with("{\"default_fd\":"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn packets_flow_through_matching_channels() {
        let mut session = session();
        let targets = session.classifier().target_names();
        let map = session.configure(&targets).unwrap();
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        theirs.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        session
            .run(TunDevice::from_fd(OwnedFd::from(ours)).unwrap(), 1500, Framing::Auto)
            .unwrap();

        let client = Ipv4Addr::new(10, 0, 0, 2);
        let query = testutil::dns_query(1, "ads.blocked.example", TYPE_A);
        let dns = testutil::ipv4_udp(client, 5000, Ipv4Addr::new(8, 8, 8, 8), 53, &query);
        let web = testutil::ipv4(6, client, Ipv4Addr::new(93, 184, 216, 34), &[0; 20]);
        let garbage = [0xFFu8; 3];

        let reject = host_end(&map, "REJECT", &session);
        let proxy = host_end(&map, "proxyA", &session);
        let default = host_end(&map, DEFAULT_CHANNEL, &session);

        let mut buf = [0u8; 2048];
        theirs.send(&dns).unwrap();
        let n = reject.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &dns[..]);

        theirs.send(&web).unwrap();
        let n = proxy.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &web[..]);

        theirs.send(&garbage).unwrap();
        let n = default.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &garbage[..]);

        // Return path: a DNS answer from a channel reaches the tunnel and
        // teaches the classifier the address.
        let answer = testutil::dns_answer(1, "cdn.example", &["151.101.1.1".parse().unwrap()]);
        let reply = testutil::ipv4_udp(Ipv4Addr::new(8, 8, 8, 8), 53, client, 5000, &answer);
        proxy.send(&reply).unwrap();
        let n = theirs.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &reply[..]);

        let mut learned = None;
        for _ in 0..100 {
            learned = session.classifier().snooped_host("151.101.1.1".parse().unwrap());
            if learned.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(learned.as_deref(), Some("cdn.example"));

        session.close();
    }
}
