//! Static `dns.hosts` rewrites: `host -> host` or `host:port -> host:port`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::{debug, warn};

use crate::address::{AddrContext, Address};
use crate::dns::{LookupIps, LookupOptions, Resolver};
use crate::error::DnsError;

const HOSTS_TTL: u32 = 600;

/// `host:port` or `[v6]:port`; a bare host (including a bare v6 literal) is `None`.
fn split_host_port(s: &str) -> Option<(&str, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return Some((host, port.parse().ok()?));
    }
    let (host, port) = s.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}

#[derive(Debug, Default)]
pub struct Hosts {
    by_host: HashMap<String, String>,
    by_addr: HashMap<String, Address>,
}

impl Hosts {
    /// Entries mixing a bare host with a `host:port` are skipped.
    pub fn new(entries: &HashMap<String, String>) -> Self {
        let mut hosts = Self::default();
        for (from, to) in entries {
            match (split_host_port(from), split_host_port(to)) {
                (Some((fh, fp)), Some((th, tp))) => {
                    let key = Address::new(fh, fp).to_string();
                    hosts.by_addr.insert(key, Address::new(th, tp));
                }
                (None, None) => {
                    let from = Address::new(from, 0).hostname();
                    let to = Address::new(to, 0).hostname();
                    hosts.by_host.insert(from, to);
                }
                _ => warn!(target = "hosts", from = %from, to = %to, "mixed host and host:port entry ignored"),
            }
        }
        hosts
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty() && self.by_addr.is_empty()
    }

    /// Applies a rewrite, recording the original in `ctx.hosts`.
    pub fn dispatch_addr(&self, ctx: &mut AddrContext, addr: Address) -> Address {
        let hostname = addr.hostname();
        if let Some(to) = self.by_host.get(&hostname) {
            debug!(target = "hosts", from = %addr, to = %to, "host rewritten");
            ctx.hosts = Some(hostname);
            return addr.with_hostname(to);
        }
        let key = addr.to_string();
        if let Some(to) = self.by_addr.get(&key) {
            debug!(target = "hosts", from = %addr, to = %to, "address rewritten");
            ctx.hosts = Some(key);
            return to.clone();
        }
        addr
    }

    fn map_host(&self, domain: &str) -> Option<&str> {
        self.by_host
            .get(&domain.trim_end_matches('.').to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Resolver that answers hosts entries locally and forwards the rest.
pub struct HostsResolver {
    hosts: Arc<Hosts>,
    inner: Arc<dyn Resolver>,
}

impl HostsResolver {
    pub fn new(hosts: Arc<Hosts>, inner: Arc<dyn Resolver>) -> Self {
        Self { hosts, inner }
    }
}

#[async_trait]
impl Resolver for HostsResolver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn lookup_ip(&self, domain: &str, opts: &LookupOptions) -> Result<LookupIps, DnsError> {
        match self.hosts.map_host(domain) {
            Some(to) => match to.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) => Ok(LookupIps {
                    v4: vec![v4],
                    v6: vec![],
                }),
                Ok(IpAddr::V6(v6)) => Ok(LookupIps {
                    v4: vec![],
                    v6: vec![v6],
                }),
                Err(_) => self.inner.lookup_ip(to, opts).await,
            },
            None => self.inner.lookup_ip(domain, opts).await,
        }
    }

    /// A/AAAA for an IP entry are synthesized; a family mismatch yields an empty
    /// NOERROR answer. Domain entries are resolved under the target name.
    async fn raw(&self, question: &Query) -> Result<Message, DnsError> {
        let qtype = question.query_type();
        let Some(to) = self
            .hosts
            .map_host(&question.name().to_utf8())
            .filter(|_| matches!(qtype, RecordType::A | RecordType::AAAA))
        else {
            return self.inner.raw(question).await;
        };

        let mut msg = match to.parse::<IpAddr>() {
            Ok(ip) => {
                let mut msg = Message::new();
                msg.set_message_type(MessageType::Response)
                    .set_recursion_available(true)
                    .set_response_code(ResponseCode::NoError);
                let rdata = match (qtype, ip) {
                    (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A(v4))),
                    (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA(v6))),
                    _ => None,
                };
                if let Some(rdata) = rdata {
                    msg.add_answer(Record::from_rdata(question.name().clone(), HOSTS_TTL, rdata));
                }
                msg
            }
            Err(_) => {
                let target = Name::from_utf8(format!("{}.", to.trim_end_matches('.')))?;
                let mut msg = self.inner.raw(&Query::query(target, qtype)).await?;
                let mut answers = msg.take_answers();
                for record in &mut answers {
                    record.set_name(question.name().clone());
                }
                msg.insert_answers(answers);
                msg
            }
        };
        msg.take_queries();
        msg.add_query(question.clone());
        Ok(msg)
    }

    async fn close(&self) -> Result<(), DnsError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;
    use crate::dns::ErrorResolver;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn hosts() -> Arc<Hosts> {
        let mut map = HashMap::new();
        map.insert("router.lan".to_string(), "192.168.1.1".to_string());
        map.insert("alias.test".to_string(), "Real.Test".to_string());
        map.insert("svc.test:80".to_string(), "10.0.0.5:8080".to_string());
        map.insert("mixed.test".to_string(), "10.0.0.6:80".to_string());
        Arc::new(Hosts::new(&map))
    }

    #[test]
    fn rewrites_host_and_host_port() {
        let h = hosts();
        let mut ctx = AddrContext::new(Network::Tcp);
        let a = h.dispatch_addr(&mut ctx, Address::new("router.lan", 443));
        assert_eq!(a.to_string(), "192.168.1.1:443");
        assert_eq!(ctx.hosts.as_deref(), Some("router.lan"));

        let mut ctx = AddrContext::new(Network::Tcp);
        let b = h.dispatch_addr(&mut ctx, Address::new("svc.test", 80));
        assert_eq!(b.to_string(), "10.0.0.5:8080");
        assert_eq!(ctx.hosts.as_deref(), Some("svc.test:80"));

        let mut ctx = AddrContext::new(Network::Tcp);
        let c = h.dispatch_addr(&mut ctx, Address::new("mixed.test", 80));
        assert_eq!(c.to_string(), "mixed.test:80");
        assert!(ctx.hosts.is_none());
    }

    #[test]
    fn split_host_port_forms() {
        assert_eq!(split_host_port("a.test:53"), Some(("a.test", 53)));
        assert_eq!(split_host_port("[::1]:53"), Some(("::1", 53)));
        assert_eq!(split_host_port("::1"), None);
        assert_eq!(split_host_port("a.test"), None);
    }

    #[tokio::test]
    async fn literal_entries_skip_upstream() {
        let r = HostsResolver::new(hosts(), Arc::new(ErrorResolver::blocked()));
        let ips = r.lookup_ip("router.lan.", &LookupOptions::default()).await.unwrap();
        assert_eq!(ips.v4, vec![Ipv4Addr::new(192, 168, 1, 1)]);

        let q = Query::query(Name::from_str("router.lan.").unwrap(), RecordType::A);
        let msg = r.raw(&q).await.unwrap();
        assert_eq!(msg.answers().len(), 1);
        assert_eq!(msg.queries()[0].name().to_utf8(), "router.lan.");

        // Everything else reaches the inner resolver.
        assert!(r.lookup_ip("other.test", &LookupOptions::default()).await.is_err());
    }
}
