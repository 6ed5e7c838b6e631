use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::svcb::{IpHint, SVCB, SvcParamKey, SvcParamValue};
use hickory_proto::rr::rdata::{A, AAAA, HTTPS, PTR};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::debug;

use super::pool::FakeIpPool;
use crate::config::ResolveStrategy;
use crate::dns::{LookupIps, LookupOptions, Resolver};
use crate::error::DnsError;

const FAKE_TTL: u32 = 40;
const ARPA_V4: &str = ".in-addr.arpa";
const ARPA_V6: &str = ".ip6.arpa";

/// Parses a reverse-DNS name (`in-addr.arpa` or `ip6.arpa`) into its address.
pub fn parse_ptr(name: &str) -> Option<IpAddr> {
    let name = name.trim_end_matches('.').to_ascii_lowercase();

    if let Some(nibbles) = name.strip_suffix(ARPA_V6) {
        let digits: Vec<&str> = nibbles.split('.').collect();
        if digits.len() != 32 {
            return None;
        }
        let mut value: u128 = 0;
        for d in digits.iter().rev() {
            if d.len() != 1 {
                return None;
            }
            value = (value << 4) | u128::from_str_radix(d, 16).ok()?;
        }
        return Some(IpAddr::V6(Ipv6Addr::from(value)));
    }

    let octets = name.strip_suffix(ARPA_V4)?;
    let parts: Vec<u8> = octets
        .split('.')
        .map(|p| p.parse::<u8>().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [a, b, c, d] => Some(IpAddr::V4(Ipv4Addr::new(*d, *c, *b, *a))),
        _ => None,
    }
}

/// Loose hostname check: 1..=253 chars, labels of 1..=63 `[a-z0-9_-]`.
pub(crate) fn is_domain_name(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

/// Resolver decorator answering A/AAAA/HTTPS/PTR from the fake-ip pools.
#[derive(Clone)]
pub struct FakeDns {
    upstream: Arc<dyn Resolver>,
    v4: Arc<FakeIpPool>,
    v6: Arc<FakeIpPool>,
    skip_upstream_check: bool,
}

impl FakeDns {
    pub fn new(upstream: Arc<dyn Resolver>, v4: Arc<FakeIpPool>, v6: Arc<FakeIpPool>) -> Self {
        Self {
            upstream,
            v4,
            v6,
            skip_upstream_check: false,
        }
    }

    /// A/AAAA are faked without asking upstream whether real records exist.
    pub fn skip_upstream_check(mut self, skip: bool) -> Self {
        self.skip_upstream_check = skip;
        self
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.v4.contains(ip) || self.v6.contains(ip)
    }

    pub fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        self.v4.reverse_lookup(ip).or_else(|| self.v6.reverse_lookup(ip))
    }

    pub fn v4_pool(&self) -> &Arc<FakeIpPool> {
        &self.v4
    }

    fn answer(question: &Query, code: ResponseCode, rdata: Option<RData>) -> Message {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response)
            .set_recursion_desired(false)
            .set_recursion_available(true)
            .set_response_code(code)
            .add_query(question.clone());
        if let Some(rdata) = rdata {
            msg.add_answer(Record::from_rdata(question.name().clone(), FAKE_TTL, rdata));
        }
        msg
    }

    /// Upstream answer for `question`, or `None` when it carries records of that type
    /// and should be replaced by a fake one.
    async fn upstream_unless_answered(&self, question: &Query) -> Result<Option<Message>, DnsError> {
        if self.skip_upstream_check {
            return Ok(None);
        }
        let msg = self.upstream.raw(question).await?;
        let has_answer = msg
            .answers()
            .iter()
            .any(|r| r.record_type() == question.query_type());
        Ok((!has_answer).then_some(msg))
    }
}

/// Appends one ipv4hint and one ipv6hint to the first HTTPS answer.
pub(crate) fn append_ip_hints(msg: &mut Message, v4: Ipv4Addr, v6: Ipv6Addr) {
    let mut answers = msg.take_answers();
    if let Some(record) = answers
        .iter_mut()
        .find(|r| matches!(r.data(), Some(RData::HTTPS(_))))
    {
        if let Some(RData::HTTPS(HTTPS(svcb))) = record.data() {
            let mut params = svcb.svc_params().to_vec();
            params.push((SvcParamKey::Ipv4Hint, SvcParamValue::Ipv4Hint(IpHint(vec![A(v4)]))));
            params.push((SvcParamKey::Ipv6Hint, SvcParamValue::Ipv6Hint(IpHint(vec![AAAA(v6)]))));
            let rebuilt = SVCB::new(svcb.svc_priority(), svcb.target_name().clone(), params);
            record.set_data(Some(RData::HTTPS(HTTPS(rebuilt))));
        }
    }
    msg.insert_answers(answers);
}

fn v4_of(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}

fn v6_of(ip: IpAddr) -> Option<Ipv6Addr> {
    match ip {
        IpAddr::V6(v6) => Some(v6),
        IpAddr::V4(_) => None,
    }
}

#[async_trait]
impl Resolver for FakeDns {
    fn name(&self) -> &str {
        "fakedns"
    }

    async fn lookup_ip(&self, domain: &str, opts: &LookupOptions) -> Result<LookupIps, DnsError> {
        if !is_domain_name(domain) {
            return Err(DnsError::not_found(domain));
        }
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let want_v4 = !matches!(opts.strategy, ResolveStrategy::OnlyV6 | ResolveStrategy::PreferV6);
        let want_v6 = !matches!(opts.strategy, ResolveStrategy::OnlyV4 | ResolveStrategy::PreferV4);

        let mut ips = LookupIps::default();
        if want_v4 {
            ips.v4.extend(v4_of(self.v4.get_or_allocate(&domain)));
        }
        if want_v6 {
            ips.v6.extend(v6_of(self.v6.get_or_allocate(&domain)));
        }
        Ok(ips)
    }

    async fn raw(&self, question: &Query) -> Result<Message, DnsError> {
        let qtype = question.query_type();
        if !matches!(
            qtype,
            RecordType::A | RecordType::AAAA | RecordType::PTR | RecordType::HTTPS
        ) {
            return self.upstream.raw(question).await;
        }

        let fqdn = question.name().to_utf8();
        if !is_domain_name(&fqdn) {
            return Ok(Self::answer(question, ResponseCode::NXDomain, None));
        }
        let domain = fqdn.trim_end_matches('.').to_ascii_lowercase();
        if domain.parse::<IpAddr>().is_ok() {
            return self.upstream.raw(question).await;
        }

        match qtype {
            RecordType::PTR => {
                let Some(ip) = parse_ptr(&domain) else {
                    return Ok(Self::answer(question, ResponseCode::NXDomain, None));
                };
                let Some(target) = self.reverse_lookup(ip) else {
                    return self.upstream.raw(question).await;
                };
                let target = Name::from_utf8(format!("{target}."))?;
                debug!(target = "fakedns", ip = %ip, domain = %target, "ptr answered from pool");
                Ok(Self::answer(question, ResponseCode::NoError, Some(RData::PTR(PTR(target)))))
            }
            RecordType::HTTPS => {
                let mut msg = self.upstream.raw(question).await?;
                if let (Some(v4), Some(v6)) = (
                    v4_of(self.v4.get_or_allocate(&domain)),
                    v6_of(self.v6.get_or_allocate(&domain)),
                ) {
                    append_ip_hints(&mut msg, v4, v6);
                }
                Ok(msg)
            }
            RecordType::AAAA => {
                if let Some(upstream) = self.upstream_unless_answered(question).await? {
                    return Ok(upstream);
                }
                let rdata = v6_of(self.v6.get_or_allocate(&domain)).map(|ip| RData::AAAA(AAAA(ip)));
                Ok(Self::answer(question, ResponseCode::NoError, rdata))
            }
            _ => {
                if let Some(upstream) = self.upstream_unless_answered(question).await? {
                    return Ok(upstream);
                }
                let rdata = v4_of(self.v4.get_or_allocate(&domain)).map(|ip| RData::A(A(ip)));
                Ok(Self::answer(question, ResponseCode::NoError, rdata))
            }
        }
    }

    async fn close(&self) -> Result<(), DnsError> {
        Ok(())
    }
}
