use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use ipnet::IpNet;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Setting {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub bypass: BypassConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BypassConfig {
    /// Network-level override for TCP; `bypass` defers to rule matching.
    #[serde(default = "default_network_mode")]
    pub tcp_mode: Mode,
    #[serde(default = "default_network_mode")]
    pub udp_mode: Mode,
    /// Verdict mode when no rule matches.
    #[serde(default = "default_mode")]
    pub default_mode: Mode,
    #[serde(default)]
    pub bypass_file: Option<PathBuf>,
    #[serde(default)]
    pub custom_rules: Vec<CustomRule>,
    /// Resolve domains to IPs before handing them to the proxy dialer.
    #[serde(default)]
    pub resolve_remote_domain: bool,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            tcp_mode: default_network_mode(),
            udp_mode: default_network_mode(),
            default_mode: default_mode(),
            bypass_file: None,
            custom_rules: Vec::new(),
            resolve_remote_domain: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomRule {
    pub hostnames: Vec<String>,
    pub mode: Mode,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub resolver: Option<String>,
    #[serde(default)]
    pub resolve_strategy: ResolveStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub fakedns: bool,
    #[serde(default = "default_fake_ipv4_range")]
    pub fakedns_ip_range: String,
    #[serde(default = "default_fake_ipv6_range")]
    pub fakedns_ipv6_range: String,
    /// Domains (trie patterns) that always resolve through the real upstream.
    #[serde(default)]
    pub fakedns_whitelist: Vec<String>,
    /// Fake A/AAAA answers without first asking upstream whether real records exist.
    #[serde(default)]
    pub fakedns_skip_check_upstream: bool,
    /// `host -> host` or `host:port -> host:port` rewrites.
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    /// Named resolvers; `direct` and `proxy` are the per-mode defaults.
    #[serde(default)]
    pub resolver: HashMap<String, ResolverConfig>,
    #[serde(default = "default_bootstrap")]
    pub bootstrap: ResolverConfig,
    /// Fake-IP persistence file; in-memory only when unset.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            fakedns: false,
            fakedns_ip_range: default_fake_ipv4_range(),
            fakedns_ipv6_range: default_fake_ipv6_range(),
            fakedns_whitelist: Vec::new(),
            fakedns_skip_check_upstream: false,
            hosts: HashMap::new(),
            resolver: HashMap::new(),
            bootstrap: default_bootstrap(),
            cache_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResolverConfig {
    #[serde(rename = "type", default = "default_resolver_type")]
    pub kind: ResolverType,
    pub host: String,
    /// Further servers of the same type, raced against `host` as one group.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// EDNS client subnet, CIDR or bare address.
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub tls_servername: Option<String>,
    /// Mode whose dialer carries this resolver's queries. Unset means `proxy`
    /// for the resolver named `proxy` and `direct` for every other one.
    #[serde(default)]
    pub mode: Option<Mode>,
}

impl ResolverConfig {
    /// `host` first, then the extra group members in order.
    pub fn servers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.host.as_str()).chain(self.hosts.iter().map(String::as_str))
    }

    pub fn dial_mode(&self, name: &str) -> Mode {
        match self.mode {
            Some(mode) => mode,
            None if name == "proxy" => Mode::Proxy,
            None => Mode::Direct,
        }
    }

    /// A bare address is treated as a host route (/32 or /128).
    pub fn parse_subnet(&self) -> Result<Option<IpNet>> {
        let Some(raw) = self.subnet.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        if let Ok(net) = raw.parse::<IpNet>() {
            return Ok(Some(net));
        }
        let ip: std::net::IpAddr = raw
            .parse()
            .with_context(|| format!("parse subnet: {raw}"))?;
        Ok(Some(IpNet::from(ip)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverType {
    Udp,
    Tcp,
    Doh,
    Dot,
    Doq,
    Doh3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// Answer A/AAAA for inbound DNS with fake addresses even when `dns.fakedns` is off.
    #[serde(default)]
    pub hijack_fakeip: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            hijack_fakeip: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Bypass,
    Direct,
    Proxy,
    Block,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Bypass => "bypass",
            Mode::Direct => "direct",
            Mode::Proxy => "proxy",
            Mode::Block => "block",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bypass" => Ok(Mode::Bypass),
            "direct" => Ok(Mode::Direct),
            "proxy" => Ok(Mode::Proxy),
            "block" => Ok(Mode::Block),
            other => anyhow::bail!("unknown mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStrategy {
    #[default]
    Default,
    #[serde(alias = "prefer_ipv4", alias = "preferv4")]
    PreferV4,
    #[serde(alias = "only_ipv4", alias = "onlyv4")]
    OnlyV4,
    #[serde(alias = "prefer_ipv6", alias = "preferv6")]
    PreferV6,
    #[serde(alias = "only_ipv6", alias = "onlyv6")]
    OnlyV6,
}

impl FromStr for ResolveStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "default" => Ok(ResolveStrategy::Default),
            "preferv4" | "preferipv4" => Ok(ResolveStrategy::PreferV4),
            "onlyv4" | "onlyipv4" => Ok(ResolveStrategy::OnlyV4),
            "preferv6" | "preferipv6" => Ok(ResolveStrategy::PreferV6),
            "onlyv6" | "onlyipv6" => Ok(ResolveStrategy::OnlyV6),
            other => anyhow::bail!("unknown resolve strategy: {other}"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Setting> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Setting = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    // Validate prefixes and subnets up front so a bad reload keeps the old snapshot.
    cfg.dns
        .fakedns_ip_range
        .parse::<IpNet>()
        .with_context(|| format!("parse fakedns_ip_range: {}", cfg.dns.fakedns_ip_range))?;
    cfg.dns
        .fakedns_ipv6_range
        .parse::<IpNet>()
        .with_context(|| format!("parse fakedns_ipv6_range: {}", cfg.dns.fakedns_ipv6_range))?;
    for (name, resolver) in &cfg.dns.resolver {
        resolver
            .parse_subnet()
            .with_context(|| format!("resolver {name}"))?;
    }
    cfg.dns.bootstrap.parse_subnet().context("bootstrap resolver")?;

    Ok(cfg)
}


fn default_network_mode() -> Mode {
    Mode::Bypass
}

fn default_mode() -> Mode {
    Mode::Proxy
}

fn default_fake_ipv4_range() -> String {
    "10.2.0.1/24".to_string()
}

fn default_fake_ipv6_range() -> String {
    "fc00::/64".to_string()
}

fn default_resolver_type() -> ResolverType {
    ResolverType::Udp
}

fn default_bootstrap() -> ResolverConfig {
    ResolverConfig {
        kind: ResolverType::Doh,
        host: "1.1.1.1".to_string(),
        hosts: vec!["223.5.5.5".to_string()],
        subnet: None,
        tls_servername: None,
        mode: Some(Mode::Direct),
    }
}

fn default_bind_udp() -> String {
    "127.0.0.1:5353".to_string()
}

fn default_bind_tcp() -> String {
    "127.0.0.1:5353".to_string()
}
