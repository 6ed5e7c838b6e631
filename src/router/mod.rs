//! The shunt: picks a mode per destination and hands out the dialer and
//! resolver bound to it.
//!
//! Everything derived from one [`Setting`] lives in a [`Snapshot`] that is
//! rebuilt off to the side and swapped in whole, so a dispatch never sees a
//! half-applied reload.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::{AddrContext, Address, Network};
use crate::bypass::RuleSet;
use crate::config::{BypassConfig, Mode, ResolverConfig, Setting};
use crate::dialer::{BoxStream, Datagram, Dialer, DirectDialer, ErrorDialer};
use crate::dns::{ErrorResolver, LookupOptions, Resolver, SharedResolver, build_resolver};
use crate::error::RouteError;
use crate::fakeip::{Fakedns, FakeIpStore};
use crate::hosts::{Hosts, HostsResolver};

#[derive(Clone)]
struct Route {
    dialer: Arc<dyn Dialer>,
    resolver: Arc<dyn Resolver>,
}

struct NamedResolver {
    cfg: ResolverConfig,
    slot: Arc<SharedResolver>,
}

struct Snapshot {
    bypass: BypassConfig,
    rules: RuleSet,
    routes: HashMap<Mode, Route>,
    named: HashMap<String, NamedResolver>,
    bootstrap_cfg: ResolverConfig,
    hosts: Arc<Hosts>,
    fakedns: Fakedns,
}

impl Snapshot {
    fn network_mode(&self, network: Network) -> Mode {
        match network {
            Network::Tcp => self.bypass.tcp_mode,
            Network::Udp => self.bypass.udp_mode,
        }
    }

    /// `bypass` is not a route; it falls through to the default mode.
    fn effective(&self, mode: Mode) -> Mode {
        match (mode, self.bypass.default_mode) {
            (Mode::Bypass, Mode::Bypass) => Mode::Proxy,
            (Mode::Bypass, default) => default,
            (mode, _) => mode,
        }
    }

    /// Forced mode, then the network mode, then the rule verdict. Verdict
    /// metadata is copied into `ctx`; the named resolver override is returned.
    fn decide(&self, ctx: &mut AddrContext, addr: &Address) -> (Mode, Option<Arc<str>>) {
        if let Some(forced) = ctx.forced_mode {
            return (self.effective(forced), None);
        }
        let network_mode = self.network_mode(ctx.network);
        if network_mode != Mode::Bypass {
            return (network_mode, None);
        }
        match self.rules.search(addr) {
            Some(verdict) => {
                if let Some(tag) = verdict.tag.as_deref() {
                    ctx.tag = Some(tag.to_string());
                }
                ctx.resolve_strategy = verdict.resolve_strategy;
                (self.effective(verdict.mode), verdict.resolver)
            }
            None => (self.effective(self.bypass.default_mode), None),
        }
    }

    fn route(&self, mode: Mode) -> Route {
        self.routes.get(&mode).cloned().unwrap_or_else(|| Route {
            dialer: Arc::new(ErrorDialer::no_dialer(mode)),
            resolver: Arc::new(ErrorResolver::no_resolver(mode)),
        })
    }

    /// A named resolver from a rule wins over the mode's own, except for `block`.
    fn resolver(&self, mode: Mode, named: Option<&str>) -> Arc<dyn Resolver> {
        if mode != Mode::Block {
            if let Some(entry) = named.and_then(|n| self.named.get(n)) {
                return entry.slot.clone();
            }
        }
        self.route(mode).resolver
    }
}

/// What survives every reload: dialers, the bootstrap slot and the fake-ip store.
struct Core {
    bootstrap: Arc<SharedResolver>,
    dialers: HashMap<Mode, Arc<dyn Dialer>>,
    store: Arc<dyn FakeIpStore>,
}

impl Core {
    fn dialer(&self, mode: Mode) -> Arc<dyn Dialer> {
        self.dialers
            .get(&mode)
            .cloned()
            .unwrap_or_else(|| Arc::new(ErrorDialer::no_dialer(mode)))
    }

    fn build_named(&self, name: &str, cfg: &ResolverConfig, slot: &SharedResolver) {
        slot.update(build_resolver(name, cfg, self.dialer(cfg.dial_mode(name))));
    }

    /// Compiles `cfg` against `previous`, reusing resolver slots and fake pools
    /// whose configuration didn't change.
    fn build(&self, cfg: &Setting, previous: Option<&Snapshot>) -> anyhow::Result<Snapshot> {
        let rules = RuleSet::build(&cfg.bypass)?;
        let fakedns = Fakedns::new(cfg, self.store.clone(), previous.map(|p| &p.fakedns))?;
        let hosts = Arc::new(Hosts::new(&cfg.dns.hosts));

        if previous.is_none_or(|p| p.bootstrap_cfg != cfg.dns.bootstrap) {
            // The bootstrap server must be a literal address.
            self.bootstrap.update(build_resolver(
                "bootstrap",
                &cfg.dns.bootstrap,
                Arc::new(DirectDialer::new(None)),
            ));
        }

        let mut named = HashMap::with_capacity(cfg.dns.resolver.len());
        for (name, rcfg) in &cfg.dns.resolver {
            let name = name.to_ascii_lowercase();
            let slot = match previous.and_then(|p| p.named.get(&name)) {
                Some(old) if old.cfg == *rcfg => old.slot.clone(),
                Some(old) => {
                    self.build_named(&name, rcfg, &old.slot);
                    old.slot.clone()
                }
                None => {
                    let slot = Arc::new(SharedResolver::new(&name));
                    self.build_named(&name, rcfg, &slot);
                    slot
                }
            };
            named.insert(name, NamedResolver { cfg: rcfg.clone(), slot });
        }
        if let Some(previous) = previous {
            for (name, old) in &previous.named {
                if !named.contains_key(name) {
                    info!(target = "shunt", resolver = %name, "resolver removed");
                    let slot = old.slot.clone();
                    tokio::spawn(async move {
                        let _ = slot.close().await;
                    });
                }
            }
        }

        let mut routes = HashMap::new();
        for mode in [Mode::Direct, Mode::Proxy] {
            let resolver: Arc<dyn Resolver> = match named.get(mode.as_str()) {
                Some(entry) => entry.slot.clone(),
                None if mode == Mode::Direct => self.bootstrap.clone(),
                None => Arc::new(ErrorResolver::no_resolver(mode)),
            };
            routes.insert(mode, Route { dialer: self.dialer(mode), resolver });
        }
        routes.insert(
            Mode::Block,
            Route {
                dialer: self.dialer(Mode::Block),
                resolver: Arc::new(ErrorResolver::blocked()),
            },
        );

        Ok(Snapshot {
            bypass: cfg.bypass.clone(),
            rules,
            routes,
            named,
            bootstrap_cfg: cfg.dns.bootstrap.clone(),
            hosts,
            fakedns,
        })
    }
}

pub struct Shunt {
    snapshot: ArcSwap<Snapshot>,
    core: Core,
    updating: Mutex<()>,
}

impl Shunt {
    /// `dialers` supplies the outbound path of each mode. `direct` defaults to a
    /// [`DirectDialer`] over the bootstrap resolver; `block` is always refused.
    pub fn new(
        cfg: &Setting,
        mut dialers: HashMap<Mode, Arc<dyn Dialer>>,
        store: Arc<dyn FakeIpStore>,
    ) -> anyhow::Result<Self> {
        let bootstrap = Arc::new(SharedResolver::new("bootstrap"));
        if !dialers.contains_key(&Mode::Direct) {
            let direct: Arc<dyn Dialer> =
                Arc::new(DirectDialer::new(Some(bootstrap.clone() as Arc<dyn Resolver>)));
            dialers.insert(Mode::Direct, direct);
        }
        dialers.insert(Mode::Block, Arc::new(ErrorDialer::blocked()));
        dialers.remove(&Mode::Bypass);

        let core = Core {
            bootstrap,
            dialers,
            store,
        };
        let first = core.build(cfg, None)?;
        Ok(Self {
            snapshot: ArcSwap::from_pointee(first),
            core,
            updating: Mutex::new(()),
        })
    }

    /// Shared bootstrap slot, for dialers built outside the shunt.
    pub fn bootstrap(&self) -> Arc<SharedResolver> {
        self.core.bootstrap.clone()
    }

    /// Applies a new setting. On error the current snapshot stays in place.
    pub fn update(&self, cfg: &Setting) -> anyhow::Result<()> {
        let _guard = self.updating.lock();
        let current = self.snapshot.load_full();
        let next = self.core.build(cfg, Some(&current))?;
        self.snapshot.store(Arc::new(next));
        info!(target = "shunt", default_mode = %cfg.bypass.default_mode,
            tcp_mode = %cfg.bypass.tcp_mode, udp_mode = %cfg.bypass.udp_mode, "shunt updated");
        Ok(())
    }

    /// Chooses the mode for `addr` and returns the address to dial. Hosts and
    /// fake-ip rewrites apply first; the chosen mode and its resolver are
    /// recorded in `ctx`.
    pub async fn dispatch(&self, ctx: &mut AddrContext, addr: Address) -> (Mode, Address) {
        let snap = self.snapshot.load_full();
        let addr = snap.hosts.dispatch_addr(ctx, addr);
        let mut addr = snap.fakedns.dispatch_addr(ctx, addr);

        let (mode, named) = snap.decide(ctx, &addr);
        let resolver = snap.resolver(mode, named.as_deref());
        ctx.chosen_mode = Some(mode);
        ctx.resolver = Some(resolver.clone());

        if snap.bypass.resolve_remote_domain && mode == Mode::Proxy && addr.is_domain() {
            let host = addr.hostname();
            let opts = LookupOptions {
                strategy: ctx.resolve_strategy,
            };
            match resolver.lookup_ip(&host, &opts).await {
                Ok(ips) => match ips.preferred(ctx.resolve_strategy) {
                    Some(ip) => {
                        addr = addr.with_ip(ip);
                        ctx.original_domain = Some(host);
                    }
                    None => warn!(target = "shunt", host = %host, "resolve remote domain returned no address"),
                },
                Err(err) => warn!(target = "shunt", host = %host, error = %err, "resolve remote domain failed"),
            }
        }

        debug!(target = "shunt", addr = %addr, mode = %mode, tag = ?ctx.tag, "dispatched");
        (mode, addr)
    }

    pub async fn connect(&self, ctx: &mut AddrContext, addr: Address) -> Result<BoxStream, RouteError> {
        ctx.network = Network::Tcp;
        let (mode, addr) = self.dispatch(ctx, addr).await;
        let dialer = self.snapshot.load().route(mode).dialer;
        dialer
            .connect_stream(ctx, &addr)
            .await
            .map_err(|source| RouteError::Dial {
                host: addr.to_string(),
                mode,
                source,
            })
    }

    pub async fn open_datagram(&self, ctx: &mut AddrContext, addr: Address) -> Result<Datagram, RouteError> {
        ctx.network = Network::Udp;
        let (mode, addr) = self.dispatch(ctx, addr).await;
        let dialer = self.snapshot.load().route(mode).dialer;
        dialer
            .open_datagram(ctx, &addr)
            .await
            .map_err(|source| RouteError::Dial {
                host: addr.to_string(),
                mode,
                source,
            })
    }

    /// Resolver that answers DNS questions for `domain`: the rule's mode
    /// resolver behind the fake-ip and hosts layers. `block` and a non-bypass
    /// network mode always fail.
    pub fn resolver_for(&self, ctx: &AddrContext, domain: &str) -> Arc<dyn Resolver> {
        let snap = self.snapshot.load_full();
        if ctx.forced_mode.is_none() && snap.network_mode(ctx.network) != Mode::Bypass {
            debug!(target = "shunt", domain = %domain, network = ?ctx.network,
                "dns refused by network mode");
            return snap.route(Mode::Block).resolver;
        }
        let mut verdict = AddrContext {
            forced_mode: ctx.forced_mode,
            network: ctx.network,
            ..Default::default()
        };
        let (mode, named) = snap.decide(&mut verdict, &Address::new(domain, 0));
        if mode == Mode::Block {
            debug!(target = "shunt", domain = %domain, "dns blocked");
            return snap.route(Mode::Block).resolver;
        }

        let upstream = snap.resolver(mode, named.as_deref());
        let resolver = snap.fakedns.wrap(ctx, domain, upstream);
        if snap.hosts.is_empty() {
            resolver
        } else {
            Arc::new(HostsResolver::new(snap.hosts.clone(), resolver))
        }
    }

    /// Whether inbound DNS answers must be faked even with `fakedns` off.
    pub fn hijack_fakeip(&self) -> bool {
        self.snapshot.load().fakedns.hijack()
    }

    /// Writes fake-ip mappings to the persistent store.
    pub fn flush(&self) {
        self.snapshot.load().fakedns.flush();
    }
}
