use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::sync::Arc;

use ipnet::IpNet;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::store::FakeIpStore;

const MAX_MAPPINGS: u128 = 65535;
const CURSOR_KEY: &str = "reserved_cursor_state";

fn step(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => u32::from(v4).checked_add(1).map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(v6) => u128::from(v6).checked_add(1).map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    }
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

struct State {
    /// `None` for a full-width prefix: every domain shares the single address.
    forward: Option<LruCache<String, IpAddr>>,
    reverse: HashMap<IpAddr, String>,
    /// Last address handed out; `None` sits one below the prefix start.
    cursor: Option<IpAddr>,
    /// Address freed by the most recent capacity eviction.
    last_popped: Option<IpAddr>,
}

/// Bijective `domain <-> address` allocator over one prefix.
pub struct FakeIpPool {
    prefix: IpNet,
    bucket: String,
    store: Arc<dyn FakeIpStore>,
    state: Mutex<State>,
}

impl FakeIpPool {
    pub fn new(prefix: IpNet, store: Arc<dyn FakeIpStore>) -> Self {
        let prefix = prefix.trunc();
        let host_bits = prefix.max_prefix_len() - prefix.prefix_len();
        let capacity = if host_bits == 0 {
            0
        } else {
            let size = 1u128.checked_shl(host_bits as u32).map_or(u128::MAX, |n| n - 1);
            size.min(MAX_MAPPINGS) as usize
        };
        let bucket = match prefix {
            IpNet::V4(_) => "fakeip_v4",
            IpNet::V6(_) => "fakeip_v6",
        }
        .to_string();

        let mut state = State {
            forward: NonZeroUsize::new(capacity).map(LruCache::new),
            reverse: HashMap::new(),
            cursor: None,
            last_popped: None,
        };

        if state.forward.is_some() {
            for (key, domain) in store.iter(&bucket) {
                let Ok(ip) = key.parse::<IpAddr>() else {
                    continue;
                };
                if !prefix.contains(&ip) {
                    continue;
                }
                let (evicted, displaced) = insert(&mut state, &domain, ip);
                if let Some((old_domain, old_ip)) = evicted {
                    store.delete(&bucket, &[&old_domain, &old_ip.to_string()]);
                }
                if let Some(old_domain) = displaced {
                    store.delete(&bucket, &[&old_domain]);
                }
            }
            state.last_popped = None;
            if let Some(cursor) = store
                .get(&bucket, CURSOR_KEY)
                .and_then(|c| c.parse::<IpAddr>().ok())
                .filter(|c| prefix.contains(c))
            {
                state.cursor = Some(cursor);
            }
        }

        info!(target = "fakeip", prefix = %prefix, capacity, restored = state.reverse.len(), "fake-ip pool ready");
        Self {
            prefix,
            bucket,
            store,
            state: Mutex::new(state),
        }
    }

    pub fn prefix(&self) -> IpNet {
        self.prefix
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.prefix.contains(&unmap(ip))
    }

    /// The address assigned to `domain`, allocating one on first use.
    pub fn get_or_allocate(&self, domain: &str) -> IpAddr {
        let mut state = self.state.lock();
        let Some(forward) = state.forward.as_mut() else {
            return self.prefix.network();
        };
        if let Some(ip) = forward.get(domain) {
            return *ip;
        }

        let ip = match state.last_popped.take() {
            Some(ip) => ip,
            None => self.advance(&mut state),
        };
        self.assign(&mut state, domain, ip);
        ip
    }

    /// Moves the cursor to the next free address, wrapping at most once. A
    /// full prefix yields its first address.
    fn advance(&self, state: &mut State) -> IpAddr {
        let first = self.prefix.network();
        let mut looped = false;
        loop {
            let next = match state.cursor {
                None => Some(first),
                Some(c) => step(c),
            }
            .filter(|ip| self.prefix.contains(ip));

            match next {
                Some(ip) => {
                    state.cursor = Some(ip);
                    if !state.reverse.contains_key(&ip) {
                        return ip;
                    }
                }
                None if looped => {
                    state.cursor = Some(first);
                    return first;
                }
                None => {
                    state.cursor = None;
                    looped = true;
                }
            }
        }
    }

    fn assign(&self, state: &mut State, domain: &str, ip: IpAddr) {
        let (evicted, displaced) = insert(state, domain, ip);
        if let Some((old_domain, old_ip)) = evicted {
            debug!(target = "fakeip", domain = %old_domain, ip = %old_ip, "evicted");
            self.store
                .delete(&self.bucket, &[&old_domain, &old_ip.to_string()]);
        }
        if let Some(old_domain) = displaced {
            self.store.delete(&self.bucket, &[&old_domain]);
        }

        let ip_key = ip.to_string();
        let cursor = state.cursor.map(|c| c.to_string()).unwrap_or_default();
        self.store.put(
            &self.bucket,
            &[(domain, &ip_key), (&ip_key, domain), (CURSOR_KEY, &cursor)],
        );
    }

    pub fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        let ip = unmap(ip);
        if !self.prefix.contains(&ip) {
            return None;
        }
        let state = self.state.lock();
        let forward = state.forward.as_ref()?;
        if let Some(domain) = state.reverse.get(&ip) {
            return Some(domain.clone());
        }
        // A stored domain that now lives on another address is stale.
        self.store
            .get(&self.bucket, &ip.to_string())
            .filter(|d| !d.is_empty())
            .filter(|d| forward.peek(d.as_str()).is_none_or(|live| *live == ip))
    }

    pub fn len(&self) -> usize {
        self.state.lock().reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) {
        if let Err(e) = self.store.flush() {
            warn!(target = "fakeip", prefix = %self.prefix, error = %e, "flush failed");
        }
    }
}

/// Inserts `domain -> ip` keeping the reverse map consistent. Returns the
/// capacity-evicted pair and the domain that previously owned `ip`, if any.
fn insert(state: &mut State, domain: &str, ip: IpAddr) -> (Option<(String, IpAddr)>, Option<String>) {
    let Some(forward) = state.forward.as_mut() else {
        return (None, None);
    };

    let displaced = state
        .reverse
        .insert(ip, domain.to_string())
        .filter(|old| old != domain);
    if let Some(old) = &displaced {
        forward.pop(old);
    }

    let mut evicted = None;
    if let Some((old_domain, old_ip)) = forward.push(domain.to_string(), ip) {
        if old_domain == domain {
            // Same key re-pointed to a new address.
            if old_ip != ip {
                state.reverse.remove(&old_ip);
            }
        } else {
            state.reverse.remove(&old_ip);
            state.last_popped = Some(old_ip);
            evicted = Some((old_domain, old_ip));
        }
    }
    (evicted, displaced)
}
