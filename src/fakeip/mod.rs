//! Fake-ip allocation, the fake-DNS resolver decorator and the routing hooks
//! that map fake addresses back to domains.

mod dns;
mod pool;
mod store;

use std::sync::Arc;

use anyhow::Context;
use ipnet::IpNet;
use tracing::{debug, info};

pub use dns::{FakeDns, parse_ptr};
pub use pool::FakeIpPool;
pub use store::{FakeIpStore, FileStore, MemoryStore};

use crate::address::{AddrContext, Address};
use crate::config::{Mode, Setting};
use crate::dns::Resolver;
use crate::matcher::DomainTrie;

/// Decides when fake answers apply and translates fake destinations.
pub struct Fakedns {
    enabled: bool,
    hijack: bool,
    skip_check_upstream: bool,
    v4: Arc<FakeIpPool>,
    v6: Arc<FakeIpPool>,
    whitelist: DomainTrie<()>,
}

impl Fakedns {
    /// Pools of `previous` are kept when their prefixes did not change, so a
    /// reload doesn't drop live mappings.
    pub fn new(
        cfg: &Setting,
        store: Arc<dyn FakeIpStore>,
        previous: Option<&Fakedns>,
    ) -> anyhow::Result<Self> {
        let v4_net: IpNet = cfg
            .dns
            .fakedns_ip_range
            .parse()
            .with_context(|| format!("fakedns_ip_range {}", cfg.dns.fakedns_ip_range))?;
        let v6_net: IpNet = cfg
            .dns
            .fakedns_ipv6_range
            .parse()
            .with_context(|| format!("fakedns_ipv6_range {}", cfg.dns.fakedns_ipv6_range))?;

        let reuse = |net: IpNet, old: Option<&Arc<FakeIpPool>>| match old {
            Some(pool) if pool.prefix() == net.trunc() => pool.clone(),
            _ => Arc::new(FakeIpPool::new(net, store.clone())),
        };
        let v4 = reuse(v4_net, previous.map(|p| &p.v4));
        let v6 = reuse(v6_net, previous.map(|p| &p.v6));

        let mut whitelist = DomainTrie::new();
        for domain in &cfg.dns.fakedns_whitelist {
            whitelist.insert(domain, ());
        }

        info!(target = "fakeip", enabled = cfg.dns.fakedns, hijack = cfg.server.hijack_fakeip,
            v4 = %v4.prefix(), v6 = %v6.prefix(), whitelist = whitelist.len(), "fakedns configured");
        Ok(Self {
            enabled: cfg.dns.fakedns,
            hijack: cfg.server.hijack_fakeip,
            skip_check_upstream: cfg.dns.fakedns_skip_check_upstream,
            v4,
            v6,
            whitelist,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn hijack(&self) -> bool {
        self.hijack
    }

    /// Fake-DNS view of `upstream`.
    pub fn fake(&self, upstream: Arc<dyn Resolver>) -> FakeDns {
        FakeDns::new(upstream, self.v4.clone(), self.v6.clone())
    }

    /// `upstream` wrapped in fake DNS when faking applies to `domain`.
    pub fn wrap(&self, ctx: &AddrContext, domain: &str, upstream: Arc<dyn Resolver>) -> Arc<dyn Resolver> {
        if !(self.enabled || ctx.force_fake_ip) || self.whitelist.contains(domain) {
            return upstream;
        }
        let skip = ctx.skip_upstream_check || self.skip_check_upstream;
        Arc::new(self.fake(upstream).skip_upstream_check(skip))
    }

    pub fn reverse_lookup(&self, ip: std::net::IpAddr) -> Option<String> {
        self.v4.reverse_lookup(ip).or_else(|| self.v6.reverse_lookup(ip))
    }

    /// Maps a fake destination back to its domain, recording the fake address in
    /// `ctx`. An unknown address inside a fake prefix is forced to `block` while
    /// faking is active, since dialing it would loop back into this process.
    pub fn dispatch_addr(&self, ctx: &mut AddrContext, addr: Address) -> Address {
        let Some(ip) = addr.ip() else {
            return addr;
        };
        if !(self.v4.contains(ip) || self.v6.contains(ip)) {
            return addr;
        }

        match self.reverse_lookup(ip) {
            Some(domain) => {
                let real = addr.with_hostname(&domain);
                debug!(target = "fakeip", fake = %addr, domain = %domain, "fake address mapped back");
                ctx.fake_ip = Some(addr);
                real
            }
            None => {
                if self.enabled || self.hijack {
                    debug!(target = "fakeip", fake = %addr, "unknown fake address, block");
                    ctx.forced_mode = Some(Mode::Block);
                }
                addr
            }
        }
    }

    pub fn flush(&self) {
        self.v4.flush();
        self.v6.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;
    use crate::dns::{LookupOptions, Resolver};
    use super::dns::tests::StaticUpstream;
    use serde_json::json;

    fn setting(value: serde_json::Value) -> Setting {
        serde_json::from_value(value).expect("setting")
    }

    #[tokio::test]
    async fn fake_answer_maps_back_to_domain() {
        let cfg = setting(json!({
            "dns": { "fakedns": true, "fakedns_ip_range": "10.2.0.0/24", "fakedns_whitelist": ["*.real.test"] }
        }));
        let f = Fakedns::new(&cfg, Arc::new(MemoryStore::new()), None).unwrap();
        let ctx = AddrContext::new(Network::Tcp);

        let resolver = f.wrap(&ctx, "foo.test", Arc::new(StaticUpstream));
        let ips = resolver.lookup_ip("foo.test", &LookupOptions::default()).await.unwrap();
        let fake_ip = std::net::IpAddr::V4(ips.v4[0]);
        assert!("10.2.0.0/24".parse::<IpNet>().unwrap().contains(&fake_ip));

        let mut ctx = AddrContext::new(Network::Tcp);
        let real = f.dispatch_addr(&mut ctx, Address::from_ip(fake_ip, 443));
        assert_eq!(real.to_string(), "foo.test:443");
        assert_eq!(ctx.fake_ip, Some(Address::from_ip(fake_ip, 443)));

        let upstream = f.wrap(&ctx, "api.real.test", Arc::new(StaticUpstream));
        assert_eq!(upstream.name(), "static");
    }

    #[test]
    fn unknown_fake_address_is_blocked() {
        let cfg = setting(json!({ "dns": { "fakedns": true } }));
        let f = Fakedns::new(&cfg, Arc::new(MemoryStore::new()), None).unwrap();
        let mut ctx = AddrContext::new(Network::Tcp);
        let addr = f.dispatch_addr(&mut ctx, Address::new("10.2.0.77", 80));
        assert_eq!(addr.to_string(), "10.2.0.77:80");
        assert_eq!(ctx.forced_mode, Some(Mode::Block));

        let mut ctx = AddrContext::new(Network::Tcp);
        f.dispatch_addr(&mut ctx, Address::new("192.0.2.1", 80));
        assert_eq!(ctx.forced_mode, None);
    }

    #[test]
    fn disabled_fakedns_passes_through_unless_forced() {
        let cfg = setting(json!({ "dns": { "fakedns": false } }));
        let f = Fakedns::new(&cfg, Arc::new(MemoryStore::new()), None).unwrap();
        let plain = f.wrap(&AddrContext::default(), "foo.test", Arc::new(StaticUpstream));
        assert_eq!(plain.name(), "static");

        let ctx = AddrContext {
            force_fake_ip: true,
            ..Default::default()
        };
        assert_eq!(f.wrap(&ctx, "foo.test", Arc::new(StaticUpstream)).name(), "fakedns");

        let mut ctx = AddrContext::default();
        f.dispatch_addr(&mut ctx, Address::new("10.2.0.77", 80));
        assert_eq!(ctx.forced_mode, None);
    }

    #[test]
    fn reload_keeps_pools_with_same_prefix() {
        let store: Arc<dyn FakeIpStore> = Arc::new(MemoryStore::new());
        let cfg = setting(json!({ "dns": { "fakedns": true } }));
        let first = Fakedns::new(&cfg, store.clone(), None).unwrap();
        let ip = first.v4.get_or_allocate("keep.test");

        let second = Fakedns::new(&cfg, store.clone(), Some(&first)).unwrap();
        assert_eq!(second.reverse_lookup(ip).as_deref(), Some("keep.test"));

        let moved = setting(json!({ "dns": { "fakedns": true, "fakedns_ip_range": "10.3.0.0/24" } }));
        let third = Fakedns::new(&moved, store, Some(&second)).unwrap();
        assert!(third.reverse_lookup(ip).is_none());
    }
}
