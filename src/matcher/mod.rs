//! Rule matching: a domain label trie and a CIDR trie behind one lookup.
//!
//! A built [`Matcher`] is treated as an immutable snapshot. Reloads build a new
//! one and swap it in; nothing mutates a matcher that readers can see.

mod cidr;
mod domain;

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use moka::sync::Cache;

pub use cidr::CidrTrie;
pub use domain::DomainTrie;

use crate::address::{Address, Host};
use crate::config::{Mode, ResolveStrategy};

/// Outcome of matching one host against the rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleVerdict {
    pub mode: Mode,
    pub tag: Option<Arc<str>>,
    pub resolve_strategy: ResolveStrategy,
    /// Named resolver overriding the mode's default one.
    pub resolver: Option<Arc<str>>,
}

impl RuleVerdict {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            tag: None,
            resolve_strategy: ResolveStrategy::Default,
            resolver: None,
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(Arc::from(tag));
        self
    }
}

const MEMO_CAPACITY: u64 = 4096;

pub struct Matcher {
    domain: DomainTrie<RuleVerdict>,
    cidr: CidrTrie<RuleVerdict>,
    memo: Cache<String, Option<RuleVerdict>>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            domain: DomainTrie::new(),
            cidr: CidrTrie::new(),
            memo: Cache::builder().max_capacity(MEMO_CAPACITY).build(),
        }
    }

    /// Inserts a CIDR, a literal IP (host route) or a domain pattern.
    pub fn insert(&mut self, pattern: &str, verdict: RuleVerdict) -> anyhow::Result<()> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(());
        }
        if pattern.contains('/') {
            let net: IpNet = pattern
                .parse()
                .map_err(|e| anyhow::anyhow!("parse cidr [{pattern}] failed: {e}"))?;
            self.cidr.insert(net, verdict);
        } else if let Ok(ip) = pattern.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            self.cidr.insert(IpNet::from(ip), verdict);
        } else {
            self.domain.insert(pattern, verdict);
        }
        self.memo.invalidate_all();
        Ok(())
    }

    pub fn search_host(&self, host: &str) -> Option<RuleVerdict> {
        if let Some(hit) = self.memo.get(host) {
            return hit;
        }
        let found = match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            Ok(ip) => self.cidr.search(ip).cloned(),
            Err(_) => self.domain.search(host).cloned(),
        };
        self.memo.insert(host.to_string(), found.clone());
        found
    }

    pub fn search(&self, addr: &Address) -> Option<RuleVerdict> {
        match addr.host() {
            Host::Ip(ip) => self.cidr.search(*ip).cloned(),
            Host::Domain(d) => self.search_host(d),
        }
    }

    /// A miss is not an error; it degrades to `default`.
    pub fn search_or(&self, addr: &Address, default: &RuleVerdict) -> RuleVerdict {
        self.search(addr).unwrap_or_else(|| default.clone())
    }

    pub fn len(&self) -> usize {
        self.domain.len() + self.cidr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.domain.clear();
        self.cidr.clear();
        self.memo.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_ip_and_domain_to_their_tries() {
        let mut m = Matcher::new();
        m.insert("10.0.0.0/8", RuleVerdict::new(Mode::Direct).with_tag("LAN"))
            .unwrap();
        m.insert("1.1.1.1", RuleVerdict::new(Mode::Block)).unwrap();
        m.insert("*.ads.test", RuleVerdict::new(Mode::Block)).unwrap();

        let v = m.search(&Address::new("10.3.4.5", 443)).unwrap();
        assert_eq!(v.mode, Mode::Direct);
        assert_eq!(v.tag.as_deref(), Some("LAN"));
        assert_eq!(m.search_host("1.1.1.1").unwrap().mode, Mode::Block);
        assert_eq!(m.search_host("x.ads.test").unwrap().mode, Mode::Block);
        assert!(m.search_host("1.1.1.2").is_none());
    }

    #[test]
    fn miss_falls_back_to_default() {
        let m = Matcher::new();
        let def = RuleVerdict::new(Mode::Proxy);
        assert_eq!(m.search_or(&Address::new("unknown.example", 80), &def), def);
    }

    #[test]
    fn bad_cidr_is_rejected() {
        let mut m = Matcher::new();
        assert!(m.insert("10.0.0.0/99", RuleVerdict::new(Mode::Direct)).is_err());
        assert!(m.is_empty());
    }

    #[test]
    fn memo_is_invalidated_by_insert() {
        let mut m = Matcher::new();
        assert!(m.search_host("a.test").is_none());
        m.insert("a.test", RuleVerdict::new(Mode::Direct)).unwrap();
        assert_eq!(m.search_host("a.test").unwrap().mode, Mode::Direct);
        m.clear();
        assert!(m.search_host("a.test").is_none());
    }
}
