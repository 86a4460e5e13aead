//! Passive packet capture.
//!
//! A [`PacketSink`] sees a copy of every packet crossing the tunnel in
//! either direction. [`HostRecorder`] is the built-in sink: it keeps a list
//! of hosts seen in DNS answers together with the addresses they resolved
//! to, plus lone public addresses seen in other traffic, and persists that
//! list as JSON.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dns::Message;
use crate::packet::{Framing, IpPacket};

/// Observer of raw tunnel packets. Called off the forwarding path.
pub trait PacketSink: Send + Sync {
    fn observe(&self, packet: &[u8]);
}

/// One recorded host and what it is associated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    /// Unix seconds when the host was first seen.
    pub time: i64,
    pub host: String,
    #[serde(default)]
    pub associated_host: Vec<String>,
    #[serde(default)]
    pub associated_ip: Vec<String>,
}

#[derive(Default)]
struct Recorded {
    infos: Vec<HostInfo>,
    /// Host or address to index in `infos`.
    index: FxHashMap<String, usize>,
}

impl Recorded {
    fn add(&mut self, host: &str) -> usize {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        self.infos.push(HostInfo {
            time,
            host: host.to_string(),
            associated_host: Vec::new(),
            associated_ip: Vec::new(),
        });
        let at = self.infos.len() - 1;
        self.index.insert(host.to_string(), at);
        at
    }
}

/// Host/address association recorder persisted to a JSON file.
pub struct HostRecorder {
    path: PathBuf,
    framing: Framing,
    recorded: Mutex<Recorded>,
}

impl HostRecorder {
    /// Start with an empty record that will be written to `path`.
    pub fn new(path: impl Into<PathBuf>, framing: Framing) -> Self {
        Self {
            path: path.into(),
            framing,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `host` (optionally with an address it resolved to), or a bare
    /// address when `host` is `None`. Local addresses are never recorded on
    /// their own. Returns whether anything changed; changes are persisted.
    pub fn record(&self, host: Option<&str>, ip: Option<IpAddr>) -> bool {
        let mut recorded = self.recorded.lock();

        let changed = match (host.filter(|h| !h.is_empty()), ip) {
            (Some(host), ip) => {
                let existing = recorded.index.get(host).copied();
                let at = match existing {
                    Some(at) => at,
                    None => recorded.add(host),
                };
                if let Some(ip) = ip {
                    let ip = ip.to_string();
                    if !recorded.infos[at].associated_ip.contains(&ip) {
                        recorded.infos[at].associated_ip.push(ip.clone());
                    }
                    recorded.index.insert(ip, at);
                }
                true
            }
            (None, Some(ip)) if !is_local_ip(ip) => {
                let key = ip.to_string();
                if recorded.index.contains_key(&key) {
                    false
                } else {
                    recorded.add(&key);
                    true
                }
            }
            _ => false,
        };

        if changed {
            if let Err(e) = save(&self.path, &sorted(&recorded.infos)) {
                warn!(path = %self.path.display(), error = %e, "failed to save host records");
            }
        }
        changed
    }

    /// Records, newest first.
    pub fn infos(&self) -> Vec<HostInfo> {
        sorted(&self.recorded.lock().infos)
    }
}

impl PacketSink for HostRecorder {
    fn observe(&self, packet: &[u8]) {
        let packet = match IpPacket::parse(packet, self.framing) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "capture skipped unparsable packet");
                return;
            }
        };

        if packet.is_dns() {
            let Ok(message) = packet.dns_message().and_then(Message::parse) else {
                return;
            };
            for record in &message.answers {
                self.record(Some(&record.name), record.address());
            }
        } else {
            self.record(None, Some(packet.dst));
            self.record(None, Some(packet.src));
        }
    }
}

fn sorted(infos: &[HostInfo]) -> Vec<HostInfo> {
    let mut infos = infos.to_vec();
    infos.sort_by(|a, b| b.time.cmp(&a.time));
    infos
}

fn save(path: &Path, infos: &[HostInfo]) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(infos)?;
    std::fs::write(path, json)
}

/// Read records back from `path`. Missing, empty or corrupt files yield an
/// empty list.
pub fn load_host_infos(path: impl AsRef<Path>) -> Vec<HostInfo> {
    std::fs::read(path)
        .ok()
        .and_then(|data| serde_json::from_slice(&data).ok())
        .unwrap_or_default()
}

/// Every host, associated host and address across `infos`, sorted and
/// deduplicated.
pub fn unique_entries(infos: &[HostInfo]) -> Vec<String> {
    let mut set = BTreeSet::new();
    for info in infos {
        set.insert(info.host.clone());
        set.extend(info.associated_host.iter().cloned());
        set.extend(info.associated_ip.iter().cloned());
    }
    set.into_iter().collect()
}

/// Unspecified, loopback, private or link-local.
pub fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified() || v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_unspecified()
                || v6.is_loopback()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}
