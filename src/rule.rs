//! Routing rules.
//!
//! A rule pairs a [`Matcher`] with the name of the upstream target that
//! carries matching traffic. Rules are evaluated in list order and the first
//! match wins; the list normally ends with a terminal `MATCH` rule.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::packet::{Flow, Transport};

/// Condition half of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Exact hostname.
    Domain(String),
    /// Hostname equal to, or a subdomain of, the suffix.
    DomainSuffix(String),
    /// Hostname containing the keyword.
    DomainKeyword(String),
    /// Destination address inside the network.
    IpCidr(IpNet),
    /// Source address inside the network.
    SrcIpCidr(IpNet),
    DstPort(u16),
    SrcPort(u16),
    Network(Transport),
    /// Catch-all terminal rule.
    Match,
}

impl Matcher {
    pub fn matches(&self, flow: &Flow) -> bool {
        match self {
            Matcher::Domain(domain) => flow.hostname().is_some_and(|h| h.eq_ignore_ascii_case(domain)),
            Matcher::DomainSuffix(suffix) => flow
                .hostname()
                .is_some_and(|h| suffix_matches(&h.to_ascii_lowercase(), suffix)),
            Matcher::DomainKeyword(keyword) => flow
                .hostname()
                .is_some_and(|h| h.to_ascii_lowercase().contains(keyword.as_str())),
            Matcher::IpCidr(net) => net.contains(&flow.dst_ip),
            Matcher::SrcIpCidr(net) => net.contains(&flow.src_ip),
            Matcher::DstPort(port) => flow.dst_port == *port,
            Matcher::SrcPort(port) => flow.src_port == *port,
            Matcher::Network(transport) => flow.transport == *transport,
            Matcher::Match => true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Matcher::Match)
    }

    fn kind(&self) -> &'static str {
        match self {
            Matcher::Domain(_) => "DOMAIN",
            Matcher::DomainSuffix(_) => "DOMAIN-SUFFIX",
            Matcher::DomainKeyword(_) => "DOMAIN-KEYWORD",
            Matcher::IpCidr(IpNet::V4(_)) => "IP-CIDR",
            Matcher::IpCidr(IpNet::V6(_)) => "IP-CIDR6",
            Matcher::SrcIpCidr(_) => "SRC-IP-CIDR",
            Matcher::DstPort(_) => "DST-PORT",
            Matcher::SrcPort(_) => "SRC-PORT",
            Matcher::Network(_) => "NETWORK",
            Matcher::Match => "MATCH",
        }
    }
}

/// Walk up the label hierarchy: `ads.example.com` matches `example.com`.
fn suffix_matches(host: &str, suffix: &str) -> bool {
    let mut current = host;

    loop {
        if current == suffix {
            return true;
        }
        match current.find('.') {
            Some(pos) => current = &current[pos + 1..],
            None => return false,
        }
    }
}

/// A matcher bound to a target name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    matcher: Matcher,
    target: Arc<str>,
}

impl Rule {
    pub fn new(matcher: Matcher, target: impl Into<Arc<str>>) -> Self {
        let matcher = match matcher {
            Matcher::Domain(d) => Matcher::Domain(normalize_domain(&d)),
            Matcher::DomainSuffix(d) => Matcher::DomainSuffix(normalize_domain(&d)),
            Matcher::DomainKeyword(k) => Matcher::DomainKeyword(k.to_ascii_lowercase()),
            other => other,
        };
        Self {
            matcher,
            target: target.into(),
        }
    }

    /// Single-address rule for `ip`, used when promoting snooped addresses.
    pub fn for_address(ip: IpAddr, target: impl Into<Arc<str>>) -> Self {
        Self::new(Matcher::IpCidr(IpNet::from(ip)), target)
    }

    /// Parse a clash-style rule line such as `DOMAIN-SUFFIX,example.com,PROXY`.
    ///
    /// A trailing `no-resolve` option is accepted and ignored.
    pub fn parse(line: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidRule {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let mut parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.last().is_some_and(|p| p.eq_ignore_ascii_case("no-resolve")) {
            parts.pop();
        }

        let kind = parts.first().map(|k| k.to_ascii_uppercase()).unwrap_or_default();
        if matches!(kind.as_str(), "MATCH" | "FINAL") {
            return match parts.as_slice() {
                [_, target] if !target.is_empty() => Ok(Self::new(Matcher::Match, *target)),
                _ => Err(invalid("expected MATCH,<target>")),
            };
        }

        let [_, payload, target] = parts.as_slice() else {
            return Err(invalid("expected <type>,<payload>,<target>"));
        };
        if payload.is_empty() || target.is_empty() {
            return Err(invalid("empty payload or target"));
        }

        let matcher = match kind.as_str() {
            "DOMAIN" => Matcher::Domain(payload.to_string()),
            "DOMAIN-SUFFIX" => Matcher::DomainSuffix(payload.to_string()),
            "DOMAIN-KEYWORD" => Matcher::DomainKeyword(payload.to_string()),
            "IP-CIDR" | "IP-CIDR6" => Matcher::IpCidr(parse_net(payload).ok_or_else(|| invalid("bad CIDR"))?),
            "SRC-IP-CIDR" => Matcher::SrcIpCidr(parse_net(payload).ok_or_else(|| invalid("bad CIDR"))?),
            "DST-PORT" => Matcher::DstPort(payload.parse().map_err(|_| invalid("bad port"))?),
            "SRC-PORT" => Matcher::SrcPort(payload.parse().map_err(|_| invalid("bad port"))?),
            "NETWORK" => match payload.to_ascii_lowercase().as_str() {
                "tcp" => Matcher::Network(Transport::Tcp),
                "udp" => Matcher::Network(Transport::Udp),
                _ => return Err(invalid("network must be tcp or udp")),
            },
            _ => return Err(invalid("unsupported rule type")),
        };

        Ok(Self::new(matcher, *target))
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn target(&self) -> &Arc<str> {
        &self.target
    }

    pub fn is_terminal(&self) -> bool {
        self.matcher.is_terminal()
    }

    pub fn matches(&self, flow: &Flow) -> bool {
        self.matcher.matches(flow)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.matcher.kind();
        match &self.matcher {
            Matcher::Domain(v) | Matcher::DomainSuffix(v) | Matcher::DomainKeyword(v) => {
                write!(f, "{kind},{v},{}", self.target)
            }
            Matcher::IpCidr(net) | Matcher::SrcIpCidr(net) => write!(f, "{kind},{net},{}", self.target),
            Matcher::DstPort(p) | Matcher::SrcPort(p) => write!(f, "{kind},{p},{}", self.target),
            Matcher::Network(Transport::Tcp) => write!(f, "{kind},tcp,{}", self.target),
            Matcher::Network(Transport::Udp) => write!(f, "{kind},udp,{}", self.target),
            Matcher::Network(Transport::Other(p)) => write!(f, "{kind},{p},{}", self.target),
            Matcher::Match => write!(f, "{kind},{}", self.target),
        }
    }
}

/// Parse rule lines, skipping blanks and `#` comments.
pub fn parse_rules<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Vec<Rule>> {
    lines
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Rule::parse)
        .collect()
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_start_matches('.').trim_end_matches('.').to_ascii_lowercase()
}

fn parse_net(payload: &str) -> Option<IpNet> {
    payload
        .parse::<IpNet>()
        .ok()
        .or_else(|| payload.parse::<IpAddr>().ok().map(IpNet::from))
}
