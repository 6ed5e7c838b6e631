use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::ResponseCode;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use super::{Request, Transport};
use crate::error::DnsError;
use crate::proto_utils::response_code;

const DEFAULT_STAGGER: Duration = Duration::from_millis(100);

/// Races several transports for one question.
///
/// Members start in order, each one a stagger after the previous or right
/// away when the previous attempt fails. The first NOERROR reply wins and the
/// remaining attempts are aborted. Without a winner the first non-success
/// reply is returned, and without any reply the collected errors are.
pub struct Group {
    members: Vec<Arc<dyn Transport>>,
    label: String,
    stagger: Duration,
}

impl Group {
    pub fn new(members: Vec<Arc<dyn Transport>>) -> Self {
        let label = format!(
            "group[{}]",
            members.iter().map(|m| m.name()).collect::<Vec<_>>().join(",")
        );
        Self {
            members,
            label,
            stagger: DEFAULT_STAGGER,
        }
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }
}

#[async_trait]
impl Transport for Group {
    async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
        if self.members.is_empty() {
            return Err(DnsError::Protocol(format!("{}: no members", self.label)));
        }

        // Dropping the set aborts every attempt still running.
        let mut set: JoinSet<(usize, Result<Bytes, DnsError>)> = JoinSet::new();
        let mut next = 0;
        let mut errors = Vec::new();
        let mut fallback_reply: Option<Bytes> = None;
        let mut deadline = pin!(sleep_until(Instant::now()));

        loop {
            if set.is_empty() && next >= self.members.len() {
                break;
            }
            let launch_now = tokio::select! {
                _ = &mut deadline, if next < self.members.len() => true,
                Some(joined) = set.join_next() => match joined {
                    Ok((idx, Ok(bytes))) => {
                        if response_code(&bytes) == Some(ResponseCode::NoError) {
                            debug!(target = "dns_group", group = %self.label,
                                winner = self.members[idx].name(), name = %req.name, "race won");
                            return Ok(bytes);
                        }
                        fallback_reply.get_or_insert(bytes);
                        true
                    }
                    Ok((_, Err(e))) => {
                        errors.push(e);
                        true
                    }
                    Err(e) => {
                        errors.push(DnsError::Protocol(format!("{}: {e}", self.label)));
                        true
                    }
                },
            };

            if launch_now && next < self.members.len() {
                let member = self.members[next].clone();
                let req = req.clone();
                let idx = next;
                set.spawn(async move { (idx, member.send(&req).await) });
                next += 1;
                deadline.as_mut().reset(Instant::now() + self.stagger);
            }
        }

        match fallback_reply {
            Some(reply) => Ok(reply),
            None => Err(DnsError::Multiple(errors)),
        }
    }

    fn name(&self) -> &str {
        &self.label
    }

    async fn close(&self) -> Result<(), DnsError> {
        for member in &self.members {
            member.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dns::tcp::tests::request;
    use hickory_proto::op::{Message, MessageType};
    use hickory_proto::rr::{RData, Record, RecordType, rdata::A};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) enum Reply {
        Code(ResponseCode),
        Fail(io::ErrorKind),
    }

    /// Answers A with 1.2.3.4 after `delay`, counting calls.
    pub(crate) struct MockTransport {
        pub name: String,
        pub reply: Reply,
        pub delay: Duration,
        pub calls: AtomicUsize,
    }

    impl MockTransport {
        pub(crate) fn new(name: &str, reply: Reply, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                reply,
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let code = match self.reply {
                Reply::Code(code) => code,
                Reply::Fail(kind) => {
                    return Err(DnsError::transport(self.name.clone(), io::Error::new(kind, "mock")));
                }
            };
            let query = Message::from_vec(&req.question).unwrap();
            let mut resp = Message::new();
            resp.set_id(query.id());
            resp.set_message_type(MessageType::Response);
            resp.set_response_code(code);
            for q in query.queries() {
                resp.add_query(q.clone());
                if code == ResponseCode::NoError && q.query_type() == RecordType::A {
                    resp.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(A::new(1, 2, 3, 4))));
                }
            }
            Ok(Bytes::from(resp.to_vec().unwrap()))
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn success_beats_servfail() {
        let bad = MockTransport::new("bad", Reply::Code(ResponseCode::ServFail), Duration::ZERO);
        let good = MockTransport::new("good", Reply::Code(ResponseCode::NoError), Duration::from_millis(20));
        let group = Group::new(vec![bad.clone(), good.clone()]);
        assert_eq!(group.name(), "group[bad,good]");

        let bytes = group.send(&request("a.test.", RecordType::A)).await.expect("reply");
        assert_eq!(response_code(&bytes), Some(ResponseCode::NoError));
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fast_winner_skips_later_members() {
        let first = MockTransport::new("first", Reply::Code(ResponseCode::NoError), Duration::ZERO);
        let second = MockTransport::new("second", Reply::Code(ResponseCode::NoError), Duration::ZERO);
        let group = Group::new(vec![first.clone(), second.clone()]).with_stagger(Duration::from_secs(5));

        group.send(&request("a.test.", RecordType::A)).await.expect("reply");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_failures_are_aggregated() {
        let a = MockTransport::new("a", Reply::Fail(io::ErrorKind::ConnectionRefused), Duration::ZERO);
        let b = MockTransport::new("b", Reply::Fail(io::ErrorKind::TimedOut), Duration::ZERO);
        let group = Group::new(vec![a, b]);

        let err = group.send(&request("a.test.", RecordType::A)).await.unwrap_err();
        assert!(err.matches(|e| e.io_kind() == Some(io::ErrorKind::ConnectionRefused)));
        assert!(err.matches(|e| e.io_kind() == Some(io::ErrorKind::TimedOut)));
    }

    #[tokio::test]
    async fn non_success_reply_returned_when_nothing_wins() {
        let a = MockTransport::new("a", Reply::Fail(io::ErrorKind::TimedOut), Duration::ZERO);
        let b = MockTransport::new("b", Reply::Code(ResponseCode::NXDomain), Duration::ZERO);
        let group = Group::new(vec![a, b]);

        let bytes = group.send(&request("a.test.", RecordType::A)).await.expect("reply");
        assert_eq!(response_code(&bytes), Some(ResponseCode::NXDomain));
    }

    #[tokio::test]
    async fn slow_primary_wins_inside_stagger_window() {
        let primary = MockTransport::new("primary", Reply::Code(ResponseCode::NoError), Duration::from_millis(50));
        let secondary = MockTransport::new("secondary", Reply::Code(ResponseCode::NoError), Duration::ZERO);
        let group = Group::new(vec![primary.clone(), secondary.clone()]);

        let started = Instant::now();
        group.send(&request("a.test.", RecordType::A)).await.expect("reply");
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < DEFAULT_STAGGER);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn primary_failure_starts_next_member_early() {
        let primary = MockTransport::new("primary", Reply::Fail(io::ErrorKind::ConnectionRefused), Duration::ZERO);
        let secondary = MockTransport::new("secondary", Reply::Code(ResponseCode::NoError), Duration::ZERO);
        let group = Group::new(vec![primary.clone(), secondary.clone()]).with_stagger(Duration::from_secs(5));

        let started = Instant::now();
        let bytes = group.send(&request("a.test.", RecordType::A)).await.expect("reply");
        assert_eq!(response_code(&bytes), Some(ResponseCode::NoError));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }
}
