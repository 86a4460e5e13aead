//! Rule table and flow classifier.
//!
//! The classifier owns the ordered rule list, a decision cache keyed by
//! hostname or destination address, and the DNS snoop map (resolved address
//! to queried hostname). All three sit behind one mutex; critical sections
//! are map lookups and a linear scan, never I/O.
//!
//! Decisions are cached by target and stable rule id rather than by list
//! position, so splicing synthesized rules into the list never invalidates
//! what is already cached.
//!
//! The decision cache, the snoop map and the synthesized per-address rules
//! are each capped; past their budget the older half is dropped, like the
//! answer cache.
//!
//! The DNS answer cache has its own lock since it may touch the disk.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::cache::AnswerCache;
use crate::dns::{self, Message};
use crate::packet::{Flow, IpPacket};
use crate::rule::Rule;

pub const DEFAULT_CACHE_INTERVAL: Duration = Duration::from_secs(120);

/// Budgets for the state the classifier learns at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_decisions: usize,
    pub max_snooped: usize,
    pub max_synthesized: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_decisions: 8192,
            max_snooped: 8192,
            max_synthesized: 1024,
        }
    }
}

/// Stable identity of a rule inside one classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(u64);

#[derive(Debug, Clone)]
struct Decision {
    rule: RuleId,
    target: Arc<str>,
    stamp: u64,
}

struct Snooped {
    host: String,
    stamp: u64,
}

/// Outcome of one rule lookup.
struct Hit {
    decision: Decision,
    terminal: bool,
}

struct Entry {
    id: RuleId,
    rule: Rule,
}

/// State guarded by the classifier mutex.
struct RuleTable {
    rules: Vec<Entry>,
    next_id: u64,
    /// Insertion counter ordering decisions and snoop entries by age.
    clock: u64,
    limits: Limits,
    decisions: FxHashMap<String, Decision>,
    snoop: FxHashMap<String, Snooped>,
    /// Synthesized address rules, oldest first.
    synthesized: VecDeque<RuleId>,
}

impl RuleTable {
    fn new(rules: Vec<Rule>, limits: Limits) -> Self {
        let mut table = Self {
            rules: Vec::with_capacity(rules.len()),
            next_id: 0,
            clock: 0,
            limits,
            decisions: FxHashMap::default(),
            snoop: FxHashMap::default(),
            synthesized: VecDeque::new(),
        };
        for rule in rules {
            let id = table.allocate_id();
            table.rules.push(Entry { id, rule });
        }
        table
    }

    fn allocate_id(&mut self) -> RuleId {
        let id = RuleId(self.next_id);
        self.next_id += 1;
        id
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remember(&mut self, key: String, rule: RuleId, target: Arc<str>) -> Decision {
        let decision = Decision {
            rule,
            target,
            stamp: self.tick(),
        };
        self.decisions.insert(key, decision.clone());
        if self.decisions.len() > self.limits.max_decisions {
            let dropped = evict_older_half(&mut self.decisions, |d| d.stamp);
            debug!(dropped, "evicted cached decisions");
        }
        decision
    }

    fn record_snoop(&mut self, ip: String, host: String) {
        let stamp = self.tick();
        self.snoop.insert(ip, Snooped { host, stamp });
        if self.snoop.len() > self.limits.max_snooped {
            let dropped = evict_older_half(&mut self.snoop, |s| s.stamp);
            debug!(dropped, "evicted snooped addresses");
        }
    }

    /// Drop the older half of the synthesized rules along with the decisions
    /// that point at them.
    fn prune_synthesized(&mut self) {
        if self.synthesized.len() <= self.limits.max_synthesized {
            return;
        }
        let count = self.synthesized.len() / 2;
        let expired: FxHashSet<RuleId> = self.synthesized.drain(..count).collect();
        self.rules.retain(|e| !expired.contains(&e.id));
        self.decisions.retain(|_, d| !expired.contains(&d.rule));
        debug!(dropped = count, "removed synthesized address rules");
    }

    /// Position right before the terminal rule, or the end of the list.
    fn insertion_point(&self) -> usize {
        match self.rules.last() {
            Some(last) if last.rule.is_terminal() => self.rules.len() - 1,
            _ => self.rules.len(),
        }
    }

    fn insert_before_terminal(&mut self, rule: Rule) -> RuleId {
        let id = self.allocate_id();
        let at = self.insertion_point();
        self.rules.insert(at, Entry { id, rule });
        id
    }

    /// First matching rule in priority order.
    fn scan(&self, flow: &Flow) -> Option<Hit> {
        let entry = self.rules.iter().find(|e| e.rule.matches(flow))?;
        Some(Hit {
            decision: Decision {
                rule: entry.id,
                target: entry.rule.target().clone(),
                stamp: 0,
            },
            terminal: entry.rule.is_terminal(),
        })
    }

    /// Full scan, caching the result under hostname-or-address unless it is
    /// the terminal rule.
    fn scan_and_cache(&mut self, flow: &Flow) -> Option<Hit> {
        let hit = self.scan(flow)?;
        if hit.terminal {
            return Some(hit);
        }
        let key = match flow.hostname() {
            Some(host) => host.to_ascii_lowercase(),
            None => flow.dst_ip.to_string(),
        };
        let decision = self.remember(key, hit.decision.rule, hit.decision.target);
        Some(Hit {
            decision,
            terminal: false,
        })
    }

    fn classify(&mut self, flow: &Flow) -> Option<Hit> {
        if let Some(host) = flow.hostname() {
            if let Some(decision) = self.decisions.get(&host.to_ascii_lowercase()) {
                return Some(cached(decision));
            }
        }

        let ip_key = flow.dst_ip.to_string();
        if let Some(decision) = self.decisions.get(&ip_key) {
            return Some(cached(decision));
        }

        if let Some(host) = self.snoop.get(&ip_key).map(|s| s.host.clone()) {
            trace!(ip = %ip_key, %host, "snoop map hit");
            if let Some(hit) = self.promote_snooped(flow, &ip_key, &host) {
                return Some(hit);
            }
        }

        self.scan_and_cache(flow)
    }

    /// Classify an address through the hostname it was resolved from, then
    /// splice a single-address rule for it so the next lookup hits directly.
    fn promote_snooped(&mut self, flow: &Flow, ip_key: &str, host: &str) -> Option<Hit> {
        let decision = match self.decisions.get(host) {
            Some(decision) => decision.clone(),
            None => {
                let named = flow.clone().with_host(host);
                let hit = self.scan_and_cache(&named)?;
                if hit.terminal {
                    return None;
                }
                hit.decision
            }
        };

        let rule = Rule::for_address(flow.dst_ip, decision.target.clone());
        debug!(%rule, %host, "synthesized rule from DNS snoop");
        let id = self.insert_before_terminal(rule);
        self.synthesized.push_back(id);
        let decision = self.remember(ip_key.to_string(), id, decision.target);
        self.prune_synthesized();

        Some(Hit {
            decision,
            terminal: false,
        })
    }
}

/// Keep the newer half of `map` by `stamp`. Stamps are unique.
fn evict_older_half<V>(map: &mut FxHashMap<String, V>, stamp: impl Fn(&V) -> u64) -> usize {
    let mut stamps: Vec<u64> = map.values().map(&stamp).collect();
    stamps.sort_unstable();
    let cutoff = stamps[stamps.len() / 2];
    let before = map.len();
    map.retain(|_, v| stamp(v) >= cutoff);
    before - map.len()
}

fn cached(decision: &Decision) -> Hit {
    Hit {
        decision: decision.clone(),
        terminal: false,
    }
}

/// A cached answer ready to send, plus whether it should be refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAnswer {
    pub response: Vec<u8>,
    pub should_refresh: bool,
}

/// Rule table, decision cache, DNS snoop map and DNS answer cache.
pub struct Classifier {
    table: Mutex<RuleTable>,
    answers: AnswerCache,
    interval: Duration,
}

impl Classifier {
    /// Classifier with a memory-only answer cache and the default interval.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self::with_answer_cache(rules, AnswerCache::default(), DEFAULT_CACHE_INTERVAL)
    }

    pub fn with_answer_cache(rules: Vec<Rule>, answers: AnswerCache, interval: Duration) -> Self {
        Self::with_limits(rules, answers, interval, Limits::default())
    }

    pub fn with_limits(rules: Vec<Rule>, answers: AnswerCache, interval: Duration, limits: Limits) -> Self {
        Self {
            table: Mutex::new(RuleTable::new(rules, limits)),
            answers,
            interval,
        }
    }

    /// Target for `flow`, or `None` when no rule matches.
    ///
    /// DNS query flows try every question name first and use the first one
    /// that reaches a non-terminal rule.
    pub fn classify(&self, flow: &Flow) -> Option<Arc<str>> {
        let mut table = self.table.lock();

        if flow.dns_mode && flow.hostname().is_none() {
            for name in &flow.dns_questions {
                let asked = flow.clone().with_host(name.as_str());
                if let Some(hit) = table.classify(&asked) {
                    if !hit.terminal {
                        debug!(question = %name, target = %hit.decision.target, "DNS question matched");
                        return Some(hit.decision.target);
                    }
                }
            }
        }

        table.classify(flow).map(|hit| hit.decision.target)
    }

    /// Classify a parsed packet.
    pub fn classify_packet(&self, packet: &IpPacket<'_>) -> Option<Arc<str>> {
        self.classify(&packet.flow())
    }

    /// Learn from a DNS message seen on the tunnel: record address to name
    /// mappings and store the answer. Anything that is not a DNS answer is
    /// ignored.
    pub fn absorb_dns_answer(&self, message: &[u8]) {
        self.absorb_dns_answer_at(message, SystemTime::now());
    }

    pub fn absorb_dns_answer_at(&self, message: &[u8], now: SystemTime) {
        let Some(parsed) = self.snoop(message) else {
            return;
        };
        if !parsed.is_response() || parsed.answers.is_empty() {
            return;
        }
        if let Some(question) = parsed.first_question() {
            self.answers.put(&question.name, question.qtype, message, now);
        }
    }

    /// Update only the snoop map from a DNS message.
    pub fn snoop_dns_answer(&self, message: &[u8]) {
        self.snoop(message);
    }

    fn snoop(&self, message: &[u8]) -> Option<Message> {
        let parsed = match Message::parse(message) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(error = %e, "ignoring non-DNS payload");
                return None;
            }
        };
        let name = parsed.first_question()?.name.clone();

        let mut table = self.table.lock();
        for ip in parsed.addresses() {
            table.record_snoop(ip.to_string(), name.clone());
        }
        drop(table);

        Some(parsed)
    }

    /// Serve a cached answer for `query` if it is younger than twice the
    /// cache interval. `should_refresh` is set once it is older than one
    /// interval.
    pub fn lookup_cached_answer(&self, query: &[u8]) -> Option<CachedAnswer> {
        self.lookup_cached_answer_at(query, SystemTime::now())
    }

    pub fn lookup_cached_answer_at(&self, query: &[u8], now: SystemTime) -> Option<CachedAnswer> {
        let parsed = Message::parse(query).ok()?;
        let question = parsed.first_question()?;
        let stored = self.answers.get(&question.name, question.qtype)?;

        let age = now.duration_since(stored.captured_at).unwrap_or_default();
        if age >= self.interval * 2 {
            return None;
        }

        let Some(response) = dns::reply_from_cache(query, &stored.response) else {
            debug!(name = %question.name, qtype = question.qtype, "discarding unusable cached answer");
            self.answers.remove(&question.name, question.qtype);
            return None;
        };

        Some(CachedAnswer {
            response,
            should_refresh: age >= self.interval,
        })
    }

    /// Hostname an address was last resolved from.
    pub fn snooped_host(&self, ip: IpAddr) -> Option<String> {
        self.table.lock().snoop.get(&ip.to_string()).map(|s| s.host.clone())
    }

    /// Snapshot of the rule list in priority order.
    pub fn rules(&self) -> Vec<Rule> {
        self.table.lock().rules.iter().map(|e| e.rule.clone()).collect()
    }

    /// Distinct targets named by the rule list, in first-seen order.
    pub fn target_names(&self) -> Vec<Arc<str>> {
        let table = self.table.lock();
        let mut names: Vec<Arc<str>> = Vec::new();
        for entry in &table.rules {
            if !names.contains(entry.rule.target()) {
                names.push(entry.rule.target().clone());
            }
        }
        names
    }

    /// Splice a rule in right before the terminal rule.
    pub fn insert_rule(&self, rule: Rule) -> RuleId {
        self.table.lock().insert_before_terminal(rule)
    }

    /// Drop the cached decision for a hostname or address string.
    pub fn invalidate(&self, key: &str) {
        self.table.lock().decisions.remove(&key.to_ascii_lowercase());
    }

    pub fn clear_decisions(&self) {
        self.table.lock().decisions.clear();
    }

    pub fn answer_cache(&self) -> &AnswerCache {
        &self.answers
    }

    pub fn cache_interval(&self) -> Duration {
        self.interval
    }
}
