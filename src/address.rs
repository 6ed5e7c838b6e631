use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::{Mode, ResolveStrategy};
use crate::dns::Resolver;
use crate::error::DnsError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Domain(String),
    Ip(IpAddr),
}

/// A connection target: domain or literal IP plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: Host,
    port: u16,
}

impl Address {
    /// Classifies `host` as IP or domain. Domains are lowercased and lose a trailing dot.
    pub fn new(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Self::from_ip(ip, port),
            Err(_) => Self {
                host: Host::Domain(host.trim_end_matches('.').to_ascii_lowercase()),
                port,
            },
        }
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        Self { host: Host::Ip(ip), port }
    }

    /// Parses `host:port` or `[v6]:port`; a bare host gets `default_port`.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, DnsError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DnsError::Protocol("empty address".to_string()));
        }
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(Self::from_ip(sa.ip(), sa.port()));
        }
        if let Ok(ip) = s.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(Self::from_ip(ip, default_port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| DnsError::Protocol(format!("invalid port in {s}")))?;
                Ok(Self::new(host, port))
            }
            _ => Ok(Self::new(s, default_port)),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn hostname(&self) -> String {
        match &self.host {
            Host::Domain(d) => d.clone(),
            Host::Ip(ip) => ip.to_string(),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self.host, Host::Domain(_))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self.host {
            Host::Ip(ip) => Some(ip),
            Host::Domain(_) => None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    pub fn with_hostname(&self, host: &str) -> Self {
        Self::new(host, self.port)
    }

    pub fn with_ip(&self, ip: IpAddr) -> Self {
        Self::from_ip(ip, self.port)
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Domain(d) => write!(f, "{}:{}", d, self.port),
            Host::Ip(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
            Host::Ip(ip) => write!(f, "{}:{}", ip, self.port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        Self::from_ip(sa.ip(), sa.port())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

/// Routing metadata carried alongside an [`Address`] through dispatch and dial.
#[derive(Clone, Default)]
pub struct AddrContext {
    pub network: Network,
    /// Set by callers that must bypass rule matching, e.g. dialing a resolver's own server.
    pub forced_mode: Option<Mode>,
    pub chosen_mode: Option<Mode>,
    pub tag: Option<String>,
    pub resolve_strategy: ResolveStrategy,
    /// Resolver that lazy resolution inside a dialer must use.
    pub resolver: Option<Arc<dyn Resolver>>,
    /// Domain that was eagerly resolved into the current IP target.
    pub original_domain: Option<String>,
    /// The fake address that was mapped back to a domain.
    pub fake_ip: Option<Address>,
    /// Address a hosts entry rewrote.
    pub hosts: Option<String>,
    /// Answer with fake addresses regardless of the `fakedns` switch.
    pub force_fake_ip: bool,
    /// Fake-DNS answers A/AAAA without first checking upstream for real records.
    pub skip_upstream_check: bool,
}

impl AddrContext {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    pub fn forced(network: Network, mode: Mode) -> Self {
        Self {
            network,
            forced_mode: Some(mode),
            ..Default::default()
        }
    }
}

impl fmt::Debug for AddrContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddrContext")
            .field("network", &self.network)
            .field("forced_mode", &self.forced_mode)
            .field("chosen_mode", &self.chosen_mode)
            .field("tag", &self.tag)
            .field("resolve_strategy", &self.resolve_strategy)
            .field("resolver", &self.resolver.as_ref().map(|r| r.name().to_string()))
            .field("original_domain", &self.original_domain)
            .field("fake_ip", &self.fake_ip)
            .field("hosts", &self.hosts)
            .finish()
    }
}
