//! DNS transports, the caching client and the resolver seam used by the router.

pub mod client;
pub mod doh;
pub mod doh3;
pub mod doq;
pub mod dot;
pub mod group;
mod quic;
pub mod shared;
pub mod tcp;
mod tls;
pub mod udp;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::RecordType;

use crate::address::Address;
use crate::config::{Mode, ResolveStrategy, ResolverConfig, ResolverType};
use crate::dialer::Dialer;
use crate::error::DnsError;

pub use client::DnsClient;
pub use group::Group;
pub use shared::SharedResolver;

/// Per-call deadline applied by every transport.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One outbound question in wire format.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u16,
    /// Lowercase, no trailing dot.
    pub name: String,
    pub qtype: RecordType,
    pub question: Bytes,
    /// Set when a previous attempt came back truncated; UDP switches to TCP.
    pub truncated: bool,
}

/// Turns a raw DNS question into a raw DNS response over one wire protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: &Request) -> Result<Bytes, DnsError>;

    fn name(&self) -> &str;

    async fn close(&self) -> Result<(), DnsError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupOptions {
    pub strategy: ResolveStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupIps {
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
}

impl LookupIps {
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// First address of the preferred family, falling back to the other one.
    pub fn preferred(&self, strategy: ResolveStrategy) -> Option<IpAddr> {
        let v4 = self.v4.first().copied().map(IpAddr::V4);
        let v6 = self.v6.first().copied().map(IpAddr::V6);
        match strategy {
            ResolveStrategy::PreferV6 | ResolveStrategy::OnlyV6 => v6.or(v4),
            _ => v4.or(v6),
        }
    }

    pub fn all(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.v4
            .iter()
            .copied()
            .map(IpAddr::V4)
            .chain(self.v6.iter().copied().map(IpAddr::V6))
    }
}

/// Answers DNS questions; implemented by clients, decorators and error stand-ins.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup_ip(&self, domain: &str, opts: &LookupOptions) -> Result<LookupIps, DnsError>;

    async fn raw(&self, question: &Query) -> Result<Message, DnsError>;

    async fn close(&self) -> Result<(), DnsError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Blocked,
    Uninitialized,
    NoRoute(Mode),
}

/// Resolver that fails every call with a fixed error.
pub struct ErrorResolver {
    name: String,
    failure: Failure,
}

impl ErrorResolver {
    /// Used for blocked destinations so they never reach a real server.
    pub fn blocked() -> Self {
        Self {
            name: "block".to_string(),
            failure: Failure::Blocked,
        }
    }

    pub fn uninitialized(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failure: Failure::Uninitialized,
        }
    }

    /// Stands in for a mode that has no resolver registered.
    pub fn no_resolver(mode: Mode) -> Self {
        Self {
            name: mode.as_str().to_string(),
            failure: Failure::NoRoute(mode),
        }
    }

    fn fail(&self, host: &str) -> DnsError {
        match self.failure {
            Failure::Blocked => DnsError::Blocked {
                host: host.trim_end_matches('.').to_string(),
            },
            Failure::Uninitialized => DnsError::Uninitialized {
                name: self.name.clone(),
            },
            Failure::NoRoute(mode) => DnsError::NoDialer { mode },
        }
    }
}

#[async_trait]
impl Resolver for ErrorResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup_ip(&self, domain: &str, _opts: &LookupOptions) -> Result<LookupIps, DnsError> {
        Err(self.fail(domain))
    }

    async fn raw(&self, question: &Query) -> Result<Message, DnsError> {
        Err(self.fail(&question.name().to_utf8()))
    }
}

/// Accepts bare host, `host:port` and `scheme://host[:port][/path]`.
pub fn parse_server_addr(host: &str, default_port: u16) -> Result<Address, DnsError> {
    let mut rest = host.trim();
    if let Some((_, after)) = rest.split_once("://") {
        rest = after;
    }
    if let Some(idx) = rest.find('/') {
        rest = &rest[..idx];
    }
    Address::parse(rest, default_port)
}

/// Lowercase, dot-free form used in cache and dispatch keys.
pub(crate) fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn server_transport(
    kind: ResolverType,
    host: &str,
    servername: Option<&str>,
    dialer: Arc<dyn Dialer>,
) -> Result<Arc<dyn Transport>, DnsError> {
    let transport: Arc<dyn Transport> = match kind {
        ResolverType::Udp => Arc::new(udp::UdpTransport::new(host, dialer)?),
        ResolverType::Tcp => Arc::new(tcp::TcpTransport::new(host, dialer)?),
        ResolverType::Dot => Arc::new(dot::DotTransport::new(host, servername, dialer)?),
        ResolverType::Doh => Arc::new(doh::DohTransport::new(host, servername, dialer)?),
        ResolverType::Doh3 => Arc::new(doh3::Doh3Transport::new(host, servername, dialer)?),
        ResolverType::Doq => Arc::new(doq::DoqTransport::new(host, servername, dialer)?),
    };
    Ok(transport)
}

/// One transport per configured server; several servers are raced as a [`Group`].
pub fn new_transport(
    cfg: &ResolverConfig,
    dialer: Arc<dyn Dialer>,
) -> Result<Arc<dyn Transport>, DnsError> {
    let mut members = cfg
        .servers()
        .map(|host| server_transport(cfg.kind, host, cfg.tls_servername.as_deref(), dialer.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    if members.len() == 1 {
        return Ok(members.remove(0));
    }
    Ok(Arc::new(Group::new(members)))
}

/// Builds a caching client for one configured resolver.
pub fn build_resolver(
    name: &str,
    cfg: &ResolverConfig,
    dialer: Arc<dyn Dialer>,
) -> Result<DnsClient, DnsError> {
    let subnet = cfg
        .parse_subnet()
        .map_err(|e| DnsError::Protocol(format!("resolver {name}: {e:#}")))?;
    let transport = new_transport(cfg, dialer)?;
    Ok(DnsClient::new(name, transport, subnet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_addr_strips_scheme_and_path() {
        let a = parse_server_addr("https://dns.google/dns-query", 443).unwrap();
        assert_eq!(a.to_string(), "dns.google:443");
        let b = parse_server_addr("tls://1.1.1.1:8853", 853).unwrap();
        assert_eq!(b.to_string(), "1.1.1.1:8853");
        let c = parse_server_addr("8.8.8.8", 53).unwrap();
        assert_eq!(c.to_string(), "8.8.8.8:53");
        let d = parse_server_addr("quic://[2001:db8::1]", 784).unwrap();
        assert_eq!(d.to_string(), "[2001:db8::1]:784");
    }

    #[test]
    fn preferred_follows_strategy() {
        let ips = LookupIps {
            v4: vec![Ipv4Addr::new(1, 2, 3, 4)],
            v6: vec!["2001:db8::1".parse().unwrap()],
        };
        assert_eq!(ips.preferred(ResolveStrategy::Default), Some("1.2.3.4".parse().unwrap()));
        assert_eq!(ips.preferred(ResolveStrategy::PreferV6), Some("2001:db8::1".parse().unwrap()));
        let only4 = LookupIps {
            v4: vec![Ipv4Addr::new(1, 2, 3, 4)],
            v6: vec![],
        };
        assert_eq!(only4.preferred(ResolveStrategy::PreferV6), Some("1.2.3.4".parse().unwrap()));
        assert_eq!(ips.all().count(), 2);
    }

    #[test]
    fn several_servers_build_a_group() {
        let dialer: Arc<dyn Dialer> = Arc::new(crate::dialer::DirectDialer::new(None));
        let cfg: ResolverConfig = serde_json::from_value(serde_json::json!({
            "type": "udp", "host": "1.1.1.1", "hosts": ["223.5.5.5:53"]
        }))
        .unwrap();
        let transport = new_transport(&cfg, dialer.clone()).unwrap();
        assert!(transport.name().starts_with("group["));

        let single: ResolverConfig =
            serde_json::from_value(serde_json::json!({ "type": "udp", "host": "1.1.1.1" })).unwrap();
        let transport = new_transport(&single, dialer).unwrap();
        assert!(!transport.name().starts_with("group["));
    }

    #[tokio::test]
    async fn blocked_resolver_never_answers() {
        let r = ErrorResolver::blocked();
        let err = r
            .lookup_ip("ads.example", &LookupOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Blocked { ref host } if host == "ads.example"));
        let u = ErrorResolver::uninitialized("remote");
        let err = u.lookup_ip("a.test", &LookupOptions::default()).await.unwrap_err();
        assert!(matches!(err, DnsError::Uninitialized { ref name } if name == "remote"));
    }
}
