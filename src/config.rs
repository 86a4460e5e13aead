//! TOML configuration.
//!
//! Every section is optional; missing fields take the defaults below.
//!
//! ```toml
//! rules = ["DOMAIN-SUFFIX,example.com,proxyA", "MATCH,DIRECT"]
//!
//! [dns]
//! listen = "127.0.0.1:5353"
//! servers = ["8.8.8.8", "1.1.1.1"]
//! modes = ["udp", "tcp", "doh"]
//! socks5 = "127.0.0.1:1080"
//!
//! [tunnel]
//! mtu = 1500
//! framing = "auto"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{AnswerCache, DEFAULT_DISK_BUDGET, DEFAULT_MAX_ENTRIES};
use crate::error::{Error, Result};
use crate::packet::Framing;
use crate::rule::{Rule, parse_rules};

pub const DEFAULT_DOH_HOST: &str = "doh.opendns.com";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rule lines in priority order.
    pub rules: Vec<String>,
    /// Extra rule file, one rule per line, appended after `rules`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,
    pub dns: DnsConfig,
    pub tunnel: TunnelConfig,
    pub capture: CaptureConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dns.max_concurrent == 0 {
            return Err(Error::Config("dns.max_concurrent must be at least 1".into()));
        }
        if self.dns.cache_interval_secs == 0 {
            return Err(Error::Config("dns.cache_interval_secs must be non-zero".into()));
        }
        if self.dns.query_timeout_ms < self.dns.attempt_timeout_ms {
            return Err(Error::Config(
                "dns.query_timeout_ms must not be shorter than dns.attempt_timeout_ms".into(),
            ));
        }
        if self.tunnel.mtu < 576 {
            return Err(Error::Config(format!("tunnel.mtu {} is below 576", self.tunnel.mtu)));
        }
        Ok(())
    }

    /// Inline rules followed by the rule file's lines.
    pub fn load_rules(&self) -> Result<Vec<Rule>> {
        let mut rules = parse_rules(self.rules.iter().map(String::as_str))?;
        if let Some(path) = &self.rules_file {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
            rules.extend(parse_rules(content.lines())?);
        }
        Ok(rules)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    Udp,
    Tcp,
    Doh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
    /// Plain resolvers; port 53 when omitted.
    pub servers: Vec<String>,
    pub modes: Vec<UpstreamMode>,
    /// DoH hostnames queried at `https://<host>/dns-query`.
    pub doh_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socks5: Option<SocketAddr>,
    /// Keep answers on disk between runs.
    pub cache: bool,
    pub cache_dir: PathBuf,
    pub cache_interval_secs: u64,
    pub max_cache_entries: usize,
    pub disk_budget_bytes: u64,
    pub attempt_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub max_concurrent: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([127, 0, 0, 1], 5353)),
            servers: vec!["8.8.8.8".to_string()],
            modes: vec![UpstreamMode::Udp, UpstreamMode::Tcp],
            doh_hosts: Vec::new(),
            socks5: None,
            cache: true,
            cache_dir: std::env::temp_dir().join("tunsplit-dns"),
            cache_interval_secs: 120,
            max_cache_entries: DEFAULT_MAX_ENTRIES,
            disk_budget_bytes: DEFAULT_DISK_BUDGET,
            attempt_timeout_ms: 3_000,
            query_timeout_ms: 5_000,
            max_concurrent: 30,
        }
    }
}

impl DnsConfig {
    pub fn cache_interval(&self) -> Duration {
        Duration::from_secs(self.cache_interval_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Configured DoH hosts, or the built-in default when none are listed.
    pub fn effective_doh_hosts(&self) -> Vec<&str> {
        if self.doh_hosts.is_empty() {
            vec![DEFAULT_DOH_HOST]
        } else {
            self.doh_hosts.iter().map(String::as_str).collect()
        }
    }

    /// Answer cache as configured: disk-backed when caching is on.
    pub fn answer_cache(&self) -> AnswerCache {
        if self.cache {
            AnswerCache::with_disk(self.max_cache_entries, &self.cache_dir, self.disk_budget_bytes)
        } else {
            AnswerCache::new(self.max_cache_entries)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub mtu: usize,
    pub framing: Framing,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            framing: Framing::Auto,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Where the host recorder keeps its JSON file; recording is off when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert!(config.rules.is_empty());
        assert_eq!(config.dns.listen, "127.0.0.1:5353".parse().unwrap());
        assert_eq!(config.dns.servers, vec!["8.8.8.8"]);
        assert_eq!(config.dns.cache_interval(), Duration::from_secs(120));
        assert_eq!(config.dns.query_timeout(), Duration::from_secs(5));
        assert_eq!(config.dns.max_concurrent, 30);
        assert_eq!(config.tunnel.mtu, 1500);
        assert_eq!(config.tunnel.framing, Framing::Auto);
        assert_eq!(config.dns.effective_doh_hosts(), vec![DEFAULT_DOH_HOST]);
    }

    #[test]
    fn parses_sections() {
        let config = Config::from_toml(
            r#"
            rules = ["DOMAIN-SUFFIX,example.com,proxyA", "MATCH,DIRECT"]

            [dns]
            servers = ["1.1.1.1", "9.9.9.9:5353"]
            modes = ["doh"]
            doh_hosts = ["dns.example"]
            socks5 = "127.0.0.1:1080"
            cache = false

            [tunnel]
            framing = "af-prefix"

            [capture]
            hosts_file = "/tmp/hosts.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.load_rules().unwrap().len(), 2);
        assert_eq!(config.dns.modes, vec![UpstreamMode::Doh]);
        assert_eq!(config.dns.socks5, Some("127.0.0.1:1080".parse().unwrap()));
        assert_eq!(config.dns.effective_doh_hosts(), vec!["dns.example"]);
        assert!(config.dns.answer_cache().disk().is_none());
        assert_eq!(config.tunnel.framing, Framing::AfPrefix);
        assert_eq!(config.capture.hosts_file, Some(PathBuf::from("/tmp/hosts.json")));
    }

    #[test]
    fn rules_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.txt");
        std::fs::write(&path, "# extra\nIP-CIDR,10.0.0.0/8,lan\nMATCH,DIRECT\n").unwrap();
        let config = Config {
            rules: vec!["DOMAIN,a.com,A".into()],
            rules_file: Some(path),
            ..Config::default()
        };

        let rules: Vec<String> = config.load_rules().unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(rules, vec!["DOMAIN,a.com,A", "IP-CIDR,10.0.0.0/8,lan", "MATCH,DIRECT"]);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Config::from_toml("[dns]\nmax_concurrent = 0").is_err());
        assert!(Config::from_toml("[dns]\nquery_timeout_ms = 100").is_err());
        assert!(Config::from_toml("[tunnel]\nmtu = 100").is_err());
        assert!(Config::from_toml("[dns]\nmodes = [\"quic\"]").is_err());
        assert!(Config::from_toml("rules = [\"BOGUS\"]").unwrap().load_rules().is_err());
    }
}
