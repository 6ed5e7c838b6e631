use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::rdata::svcb::{SVCB, SvcParamKey, SvcParamValue};
use hickory_proto::rr::rdata::HTTPS;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use ipnet::IpNet;
use rustc_hash::FxBuildHasher;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{DEFAULT_TIMEOUT, LookupIps, LookupOptions, Request, Resolver, Transport, normalize_name};
use crate::cache::{CacheEntry, DnsCache, cache_key, new_cache};
use crate::config::ResolveStrategy;
use crate::error::DnsError;

const CACHE_CAPACITY: u64 = 8192;
const DEFAULT_TTL: u32 = 600;
const EDNS_PAYLOAD: u16 = 8192;
const EDNS_CLIENT_SUBNET: u16 = 8;

type Shared = Result<Arc<Message>, DnsError>;

struct Inner {
    name: String,
    transport: Arc<dyn Transport>,
    /// Encoded client-subnet option payload.
    ecs: Option<Vec<u8>>,
    cache: DnsCache,
    inflight: DashMap<String, Vec<oneshot::Sender<Shared>>, FxBuildHasher>,
    refreshing: DashSet<String, FxBuildHasher>,
}

/// Caching resolver over one [`Transport`].
///
/// Concurrent misses on one key share a single upstream query; expired
/// entries are served once more while a background refresh runs.
#[derive(Clone)]
pub struct DnsClient {
    inner: Arc<Inner>,
}

/// family(2) | source prefix(1) | scope prefix(1) | address truncated to the prefix.
pub(crate) fn ecs_payload(subnet: IpNet) -> Vec<u8> {
    let subnet = subnet.trunc();
    let prefix = subnet.prefix_len();
    let (family, octets): (u16, Vec<u8>) = match subnet.addr() {
        IpAddr::V4(v4) => (1, v4.octets().to_vec()),
        IpAddr::V6(v6) => (2, v6.octets().to_vec()),
    };
    let keep = (prefix as usize).div_ceil(8);
    let mut out = Vec::with_capacity(4 + keep);
    out.extend_from_slice(&family.to_be_bytes());
    out.push(prefix);
    out.push(0);
    out.extend_from_slice(&octets[..keep]);
    out
}

impl DnsClient {
    pub fn new(name: &str, transport: Arc<dyn Transport>, subnet: Option<IpNet>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                transport,
                ecs: subnet.map(ecs_payload),
                cache: new_cache(CACHE_CAPACITY),
                inflight: DashMap::with_hasher(FxBuildHasher),
                refreshing: DashSet::with_hasher(FxBuildHasher),
            }),
        }
    }

    /// Cached or fresh response for `question`, shared by raw and lookup paths.
    async fn resolve(&self, question: &Query) -> Shared {
        let key = cache_key(&normalize_name(&question.name().to_utf8()), question.query_type());

        if let Some(entry) = self.inner.cache.get(&key) {
            if !entry.is_fresh() {
                self.schedule_refresh(key, question.clone());
            }
            return Ok(entry.msg);
        }

        self.singleflight(key, question.clone()).await
    }

    async fn singleflight(&self, key: String, question: Query) -> Shared {
        let (tx, rx) = oneshot::channel();
        let leader = match self.inner.inflight.entry(key.clone()) {
            Entry::Occupied(mut waiters) => {
                waiters.get_mut().push(tx);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![tx]);
                true
            }
        };

        // The leader runs detached so a canceled caller doesn't cancel the query.
        if leader {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let res = inner.query(&question).await.map(Arc::new);
                if let Some((_, waiters)) = inner.inflight.remove(&key) {
                    for waiter in waiters {
                        let _ = waiter.send(res.clone());
                    }
                }
            });
        }

        rx.await.map_err(|_| DnsError::Canceled)?
    }

    fn schedule_refresh(&self, key: String, question: Query) {
        if !self.inner.refreshing.insert(key.clone()) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match timeout(DEFAULT_TIMEOUT, inner.query(&question)).await {
                Ok(Ok(_)) => debug!(target = "dns_client", resolver = %inner.name, key = %key, "refreshed"),
                Ok(Err(e)) => {
                    warn!(target = "dns_client", resolver = %inner.name, key = %key, error = %e,
                        "background refresh failed")
                }
                Err(_) => warn!(target = "dns_client", resolver = %inner.name, key = %key,
                    "background refresh timed out"),
            }
            inner.refreshing.remove(&key);
        });
    }

    async fn lookup_family(&self, domain: &str, qtype: RecordType) -> Result<Vec<IpAddr>, DnsError> {
        let domain = normalize_name(domain);
        if domain.is_empty() {
            return Err(DnsError::Protocol("empty domain".to_string()));
        }
        let name = Name::from_str(&format!("{domain}."))
            .map_err(|e| DnsError::Protocol(format!("invalid domain {domain}: {e}")))?;

        let msg = self.resolve(&Query::query(name, qtype)).await?;
        if msg.response_code() != ResponseCode::NoError {
            debug!(target = "dns_client", resolver = %self.inner.name, name = %domain,
                qtype = %qtype, rcode = %msg.response_code(), "lookup failed");
            return Err(DnsError::not_found(domain));
        }

        let ips: Vec<IpAddr> = msg
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::A(a)) if qtype == RecordType::A => Some(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) if qtype == RecordType::AAAA => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect();
        if ips.is_empty() {
            return Err(DnsError::not_found(domain));
        }
        Ok(ips)
    }

    async fn lookup_v4(&self, domain: &str) -> Result<LookupIps, DnsError> {
        let ips = self.lookup_family(domain, RecordType::A).await?;
        Ok(split(ips))
    }

    async fn lookup_v6(&self, domain: &str) -> Result<LookupIps, DnsError> {
        let ips = self.lookup_family(domain, RecordType::AAAA).await?;
        Ok(split(ips))
    }
}

fn split(ips: Vec<IpAddr>) -> LookupIps {
    let mut out = LookupIps::default();
    for ip in ips {
        match ip {
            IpAddr::V4(v4) => out.v4.push(v4),
            IpAddr::V6(v6) => out.v6.push(v6),
        }
    }
    out
}

/// Both NotFound collapses into one NotFound; anything else is joined.
fn merge_errors(v4: DnsError, v6: DnsError) -> DnsError {
    match (&v4, &v6) {
        (DnsError::NotFound { .. }, DnsError::NotFound { .. }) => v4,
        _ => DnsError::join(v6, v4),
    }
}

impl Inner {
    /// One upstream round trip; caches the answer and any HTTPS ip hints.
    async fn query(&self, question: &Query) -> Result<Message, DnsError> {
        let id: u16 = rand::random();
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(question.clone());
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        if let Some(ecs) = &self.ecs {
            edns.options_mut()
                .insert(EdnsOption::Unknown(EDNS_CLIENT_SUBNET, ecs.clone()));
        }
        msg.set_edns(edns);

        let name = normalize_name(&question.name().to_utf8());
        let mut req = Request {
            id,
            name: name.clone(),
            qtype: question.query_type(),
            question: Bytes::from(msg.to_vec()?),
            truncated: false,
        };

        let mut resp = Message::new();
        for truncated in [false, true] {
            req.truncated = truncated;
            let bytes = self.transport.send(&req).await?;
            resp = Message::from_vec(&bytes)?;
            if resp.id() != id {
                return Err(DnsError::Protocol(format!(
                    "{}: id mismatch, want {id} got {}",
                    self.name,
                    resp.id()
                )));
            }
            if !resp.truncated() {
                break;
            }
        }

        let ttl = resp.answers().first().map(|r| r.ttl()).unwrap_or(DEFAULT_TTL);

        if matches!(question.query_type(), RecordType::HTTPS | RecordType::SVCB) {
            for (qtype, hints) in strip_ip_hints(&mut resp) {
                if ttl <= 1 {
                    continue;
                }
                let hint_query = Query::query(question.name().clone(), qtype);
                let mut hint_msg = Message::new();
                hint_msg
                    .set_message_type(MessageType::Response)
                    .set_recursion_desired(true)
                    .set_recursion_available(true)
                    .add_query(hint_query)
                    .insert_answers(hints);
                self.cache.insert(
                    cache_key(&name, qtype),
                    CacheEntry::new(hint_msg, Duration::from_secs(ttl as u64)),
                );
            }
        }

        debug!(target = "dns_client", resolver = %self.name, name = %name, qtype = %question.query_type(),
            rcode = %resp.response_code(), ttl, "resolved");

        if ttl > 1 {
            self.cache.insert(
                cache_key(&name, question.query_type()),
                CacheEntry::new(resp.clone(), Duration::from_secs(ttl as u64)),
            );
        }
        Ok(resp)
    }
}

/// Removes ipv4hint/ipv6hint params from every HTTPS and SVCB answer and returns
/// them as A and AAAA records grouped by type.
pub(crate) fn strip_ip_hints(msg: &mut Message) -> Vec<(RecordType, Vec<Record>)> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    let mut answers = msg.take_answers();

    for record in answers.iter_mut() {
        let (svcb, https) = match record.data() {
            Some(RData::HTTPS(HTTPS(svcb))) => (svcb, true),
            Some(RData::SVCB(svcb)) => (svcb, false),
            _ => continue,
        };
        let mut kept = Vec::with_capacity(svcb.svc_params().len());
        let mut stripped = false;
        for (key, value) in svcb.svc_params() {
            match (key, value) {
                (SvcParamKey::Ipv4Hint, SvcParamValue::Ipv4Hint(hint)) => {
                    stripped = true;
                    v4.extend(
                        hint.0
                            .iter()
                            .map(|a| Record::from_rdata(record.name().clone(), record.ttl(), RData::A(*a))),
                    );
                }
                (SvcParamKey::Ipv6Hint, SvcParamValue::Ipv6Hint(hint)) => {
                    stripped = true;
                    v6.extend(
                        hint.0
                            .iter()
                            .map(|a| Record::from_rdata(record.name().clone(), record.ttl(), RData::AAAA(*a))),
                    );
                }
                _ => kept.push((*key, value.clone())),
            }
        }
        if stripped {
            let rebuilt = SVCB::new(svcb.svc_priority(), svcb.target_name().clone(), kept);
            info!(target = "dns_client", name = %record.name(), https, "removed ip hints");
            let data = if https {
                RData::HTTPS(HTTPS(rebuilt))
            } else {
                RData::SVCB(rebuilt)
            };
            record.set_data(Some(data));
        }
    }
    msg.insert_answers(answers);

    let mut out = Vec::new();
    if !v4.is_empty() {
        out.push((RecordType::A, v4));
    }
    if !v6.is_empty() {
        out.push((RecordType::AAAA, v6));
    }
    out
}

#[async_trait]
impl Resolver for DnsClient {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn lookup_ip(&self, domain: &str, opts: &LookupOptions) -> Result<LookupIps, DnsError> {
        match opts.strategy {
            ResolveStrategy::OnlyV4 => self.lookup_v4(domain).await,
            ResolveStrategy::OnlyV6 => self.lookup_v6(domain).await,
            ResolveStrategy::PreferV4 => match self.lookup_v4(domain).await {
                Ok(ips) => Ok(ips),
                Err(v4) => self.lookup_v6(domain).await.map_err(|v6| merge_errors(v4, v6)),
            },
            ResolveStrategy::PreferV6 => match self.lookup_v6(domain).await {
                Ok(ips) => Ok(ips),
                Err(v6) => self.lookup_v4(domain).await.map_err(|v4| merge_errors(v4, v6)),
            },
            ResolveStrategy::Default => {
                let (v4, v6) = tokio::join!(self.lookup_v4(domain), self.lookup_v6(domain));
                match (v4, v6) {
                    (Ok(a), Ok(b)) => Ok(LookupIps { v4: a.v4, v6: b.v6 }),
                    (Ok(a), Err(_)) => Ok(a),
                    (Err(_), Ok(b)) => Ok(b),
                    (Err(a), Err(b)) => Err(merge_errors(a, b)),
                }
            }
        }
    }

    async fn raw(&self, question: &Query) -> Result<Message, DnsError> {
        let cached = self.resolve(question).await?;
        let mut msg = (*cached).clone();
        msg.take_queries();
        msg.add_query(question.clone());
        Ok(msg)
    }

    async fn close(&self) -> Result<(), DnsError> {
        self.inner.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::group::tests::{MockTransport, Reply};
    use hickory_proto::rr::rdata::opt::EdnsCode;
    use hickory_proto::rr::rdata::svcb::{IpHint, Mandatory};
    use hickory_proto::rr::rdata::{A, AAAA};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ecs_payload_truncates_address_bytes() {
        let v4: IpNet = "1.2.3.0/24".parse().unwrap();
        assert_eq!(ecs_payload(v4), vec![0, 1, 24, 0, 1, 2, 3]);
        let v4: IpNet = "10.20.30.40/12".parse().unwrap();
        assert_eq!(ecs_payload(v4), vec![0, 1, 12, 0, 10, 16]);
        let v6: IpNet = "2001:db8::/32".parse().unwrap();
        assert_eq!(ecs_payload(v6), vec![0, 2, 32, 0, 0x20, 0x01, 0x0d, 0xb8]);
    }

    fn counting_client(reply: Reply, delay: Duration) -> (DnsClient, Arc<MockTransport>) {
        let mock = MockTransport::new("mock", reply, delay);
        (DnsClient::new("test", mock.clone(), None), mock)
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_query() {
        let (client, mock) = counting_client(Reply::Code(ResponseCode::NoError), Duration::from_millis(50));
        let opts = LookupOptions {
            strategy: ResolveStrategy::OnlyV4,
        };
        let futs = (0..16).map(|_| client.lookup_ip("a.test", &opts));
        for res in futures::future::join_all(futs).await {
            assert_eq!(res.expect("lookup").v4, vec![Ipv4Addr::new(1, 2, 3, 4)]);
        }
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

        client.lookup_ip("A.Test.", &opts).await.expect("cached");
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn canceled_caller_does_not_cancel_leader() {
        let (client, mock) = counting_client(Reply::Code(ResponseCode::NoError), Duration::from_millis(50));
        let opts = LookupOptions {
            strategy: ResolveStrategy::OnlyV4,
        };
        let early = timeout(Duration::from_millis(5), client.lookup_ip("b.test", &opts)).await;
        assert!(early.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.lookup_ip("b.test", &opts).await.expect("populated by leader");
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_rcode_is_not_found() {
        let (client, _) = counting_client(Reply::Code(ResponseCode::NXDomain), Duration::ZERO);
        let err = client
            .lookup_ip("missing.test", &LookupOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::NotFound { ref name } if name == "missing.test"));
    }

    #[tokio::test]
    async fn dual_stack_returns_partial_result() {
        // The mock answers only A questions, so AAAA comes back empty.
        let (client, _) = counting_client(Reply::Code(ResponseCode::NoError), Duration::ZERO);
        let ips = client.lookup_ip("c.test", &LookupOptions::default()).await.expect("partial");
        assert_eq!(ips.v4.len(), 1);
        assert!(ips.v6.is_empty());

        let err = client
            .lookup_ip(
                "c.test",
                &LookupOptions {
                    strategy: ResolveStrategy::OnlyV6,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn transport_errors_from_both_families_are_joined() {
        let (client, _) = counting_client(Reply::Fail(std::io::ErrorKind::ConnectionRefused), Duration::ZERO);
        let err = client.lookup_ip("d.test", &LookupOptions::default()).await.unwrap_err();
        match err {
            DnsError::Multiple(errs) => assert_eq!(errs.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    struct RcodeSequence {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for RcodeSequence {
        async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let q = Message::from_vec(&req.question).unwrap();
            let mut resp = Message::new();
            resp.set_id(q.id()).set_message_type(MessageType::Response);
            for query in q.queries() {
                resp.add_query(query.clone());
                // First answer expires at once, later ones carry a real TTL.
                let ttl = if n == 0 { 2 } else { 300 };
                resp.add_answer(Record::from_rdata(
                    query.name().clone(),
                    ttl,
                    RData::A(A::new(10, 0, 0, n as u8 + 1)),
                ));
            }
            Ok(Bytes::from(resp.to_vec().unwrap()))
        }

        fn name(&self) -> &str {
            "sequence"
        }
    }

    #[tokio::test]
    async fn stale_entry_served_while_refreshing() {
        let transport = Arc::new(RcodeSequence {
            calls: AtomicUsize::new(0),
        });
        let client = DnsClient::new("test", transport.clone(), None);
        let opts = LookupOptions {
            strategy: ResolveStrategy::OnlyV4,
        };

        let first = client.lookup_ip("e.test", &opts).await.unwrap();
        assert_eq!(first.v4, vec![Ipv4Addr::new(10, 0, 0, 1)]);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let stale = client.lookup_ip("e.test", &opts).await.unwrap();
        assert_eq!(stale.v4, vec![Ipv4Addr::new(10, 0, 0, 1)]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let fresh = client.lookup_ip("e.test", &opts).await.unwrap();
        assert_eq!(fresh.v4, vec![Ipv4Addr::new(10, 0, 0, 2)]);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ip_hints_are_stripped_and_returned() {
        let name = Name::from_str("svc.test.").unwrap();
        let svcb = SVCB::new(
            1,
            Name::root(),
            vec![
                (SvcParamKey::Mandatory, SvcParamValue::Mandatory(Mandatory(vec![SvcParamKey::Alpn]))),
                (
                    SvcParamKey::Ipv4Hint,
                    SvcParamValue::Ipv4Hint(IpHint(vec![A::new(1, 1, 1, 1), A::new(1, 0, 0, 1)])),
                ),
                (
                    SvcParamKey::Ipv6Hint,
                    SvcParamValue::Ipv6Hint(IpHint(vec![AAAA(Ipv6Addr::LOCALHOST)])),
                ),
            ],
        );
        let mut msg = Message::new();
        msg.add_answer(Record::from_rdata(name.clone(), 120, RData::HTTPS(HTTPS(svcb))));

        let hints = strip_ip_hints(&mut msg);
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].0, RecordType::A);
        assert_eq!(hints[0].1.len(), 2);
        assert_eq!(hints[1].0, RecordType::AAAA);
        assert_eq!(hints[0].1[0].ttl(), 120);

        let Some(RData::HTTPS(HTTPS(svcb))) = msg.answers()[0].data() else {
            panic!("https record");
        };
        assert_eq!(svcb.svc_params().len(), 1);
        assert_eq!(svcb.svc_params()[0].0, SvcParamKey::Mandatory);
    }

    #[test]
    fn svcb_hints_are_stripped_too() {
        let name = Name::from_str("_dns.resolver.test.").unwrap();
        let svcb = SVCB::new(
            1,
            Name::from_str("dns.test.").unwrap(),
            vec![(
                SvcParamKey::Ipv4Hint,
                SvcParamValue::Ipv4Hint(IpHint(vec![A::new(1, 1, 1, 1)])),
            )],
        );
        let mut msg = Message::new();
        msg.add_answer(Record::from_rdata(name, 300, RData::SVCB(svcb)));

        let hints = strip_ip_hints(&mut msg);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].0, RecordType::A);
        assert_eq!(hints[0].1[0].data(), Some(&RData::A(A::new(1, 1, 1, 1))));

        let Some(RData::SVCB(svcb)) = msg.answers()[0].data() else {
            panic!("svcb record");
        };
        assert!(svcb.svc_params().is_empty());
    }

    /// Answers SVCB questions with one ipv4hint and records the ECS option it saw.
    struct HintTransport {
        ttl: u32,
        calls: AtomicUsize,
        seen_ecs: parking_lot::Mutex<Option<Vec<u8>>>,
    }

    impl HintTransport {
        fn new(ttl: u32) -> Arc<Self> {
            Arc::new(Self {
                ttl,
                calls: AtomicUsize::new(0),
                seen_ecs: parking_lot::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl Transport for HintTransport {
        async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let q = Message::from_vec(&req.question).unwrap();
            if let Some(edns) = q.extensions() {
                let payload = match edns.options().options().get(&EdnsCode::from(EDNS_CLIENT_SUBNET)) {
                    Some(EdnsOption::Subnet(subnet)) => Vec::<u8>::try_from(subnet).ok(),
                    Some(EdnsOption::Unknown(_, raw)) => Some(raw.clone()),
                    _ => None,
                };
                *self.seen_ecs.lock() = payload;
            }
            let mut resp = Message::new();
            resp.set_id(q.id()).set_message_type(MessageType::Response);
            for query in q.queries() {
                resp.add_query(query.clone());
                let svcb = SVCB::new(
                    1,
                    Name::root(),
                    vec![(
                        SvcParamKey::Ipv4Hint,
                        SvcParamValue::Ipv4Hint(IpHint(vec![A::new(9, 9, 9, 9)])),
                    )],
                );
                resp.add_answer(Record::from_rdata(query.name().clone(), self.ttl, RData::SVCB(svcb)));
            }
            Ok(Bytes::from(resp.to_vec().unwrap()))
        }

        fn name(&self) -> &str {
            "hints"
        }
    }

    fn svcb_query(name: &str) -> Query {
        Query::query(Name::from_str(name).unwrap(), RecordType::SVCB)
    }

    #[tokio::test]
    async fn svcb_hints_feed_the_a_cache() {
        let transport = HintTransport::new(300);
        let client = DnsClient::new("test", transport.clone(), None);
        client.raw(&svcb_query("f.test.")).await.expect("svcb");

        let opts = LookupOptions {
            strategy: ResolveStrategy::OnlyV4,
        };
        let ips = client.lookup_ip("f.test", &opts).await.expect("hinted");
        assert_eq!(ips.v4, vec![Ipv4Addr::new(9, 9, 9, 9)]);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_lived_hints_are_not_cached() {
        let transport = HintTransport::new(1);
        let client = DnsClient::new("test", transport.clone(), None);
        client.raw(&svcb_query("g.test.")).await.expect("svcb");

        assert!(client.inner.cache.get(&cache_key("g.test", RecordType::A)).is_none());
        assert!(client.inner.cache.get(&cache_key("g.test", RecordType::SVCB)).is_none());
    }

    #[tokio::test]
    async fn client_subnet_is_attached_to_queries() {
        let transport = HintTransport::new(300);
        let subnet: IpNet = "1.2.3.0/24".parse().unwrap();
        let client = DnsClient::new("test", transport.clone(), Some(subnet));
        client.raw(&svcb_query("h.test.")).await.expect("svcb");

        let seen = transport.seen_ecs.lock().clone();
        assert_eq!(seen, Some(vec![0, 1, 24, 0, 1, 2, 3]));
    }
}
