use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use moka::Expiry;
use moka::sync::Cache;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub msg: Arc<Message>,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(msg: Message, ttl: Duration) -> Self {
        Self {
            msg: Arc::new(msg),
            stored_at: Instant::now(),
            ttl,
        }
    }

    /// Past its TTL the entry is stale but still served while a refresh runs.
    #[inline]
    pub fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

/// Keyed by `"name:qtype"`.
pub type DnsCache = Cache<String, CacheEntry>;

#[inline]
pub fn cache_key(name: &str, qtype: RecordType) -> String {
    format!("{name}:{qtype}")
}

/// Entries live for two TTLs: one fresh, one stale-but-usable.
struct StaleGrace;

impl Expiry<String, CacheEntry> for StaleGrace {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl.saturating_mul(2))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl.saturating_mul(2))
    }
}

/// DNS cache whose entries outlive their TTL by one stale window.
#[inline]
pub fn new_cache(max_capacity: u64) -> DnsCache {
    Cache::builder()
        .max_capacity(max_capacity)
        .expire_after(StaleGrace)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_record_type_mnemonic() {
        assert_eq!(cache_key("example.com", RecordType::AAAA), "example.com:AAAA");
    }

    #[test]
    fn zero_ttl_entry_is_stale_immediately() {
        let entry = CacheEntry::new(Message::new(), Duration::ZERO);
        assert!(!entry.is_fresh());
        let entry = CacheEntry::new(Message::new(), Duration::from_secs(60));
        assert!(entry.is_fresh());
    }

    #[test]
    fn insert_then_get_returns_entry() {
        let cache = new_cache(16);
        cache.insert(
            cache_key("a.test", RecordType::A),
            CacheEntry::new(Message::new(), Duration::from_secs(30)),
        );
        let hit = cache.get("a.test:A").expect("cached");
        assert_eq!(hit.ttl, Duration::from_secs(30));
    }
}
