//! Inbound DNS on UDP and TCP, answered through [`Shunt::resolver_for`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info};

use crate::address::{AddrContext, Network};
use crate::error::DnsError;
use crate::proto_utils::{parse_head, set_id};
use crate::router::Shunt;

const MAX_TCP_FRAME: usize = 64 * 1024;
const MIN_UDP_PAYLOAD: usize = 512;
const UDP_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct DnsServer {
    shunt: Arc<Shunt>,
}

impl DnsServer {
    pub fn new(shunt: Arc<Shunt>) -> Self {
        Self { shunt }
    }

    /// Answers one wire-format query. `None` means the packet is dropped.
    pub async fn handle_packet(&self, packet: &[u8], network: Network) -> Option<Vec<u8>> {
        let mut name_buf = [0u8; 256];
        let head = parse_head(packet, &mut name_buf)?;
        let (id, qname) = (head.id, head.qname.to_string());

        let req = match Message::from_vec(packet) {
            Ok(req) if req.message_type() == MessageType::Query => req,
            Ok(_) => return None,
            Err(err) => {
                debug!(target = "server", qname = %qname, error = %err, "malformed query");
                return None;
            }
        };
        let question = req.queries().first()?.clone();

        let ctx = AddrContext {
            network,
            force_fake_ip: self.shunt.hijack_fakeip(),
            ..Default::default()
        };
        let resolver = self.shunt.resolver_for(&ctx, &qname);
        let mut msg = match resolver.raw(&question).await {
            Ok(msg) => msg,
            Err(err) => {
                debug!(target = "server", qname = %qname, qtype = %question.query_type(),
                    resolver = resolver.name(), error = %err, "query failed");
                let mut msg = Message::new();
                msg.set_response_code(error_rcode(&err));
                msg
            }
        };
        msg.set_message_type(MessageType::Response)
            .set_op_code(req.op_code())
            .set_recursion_desired(req.recursion_desired())
            .set_recursion_available(true);
        msg.take_queries();
        msg.add_query(question);

        let mut bytes = encode(msg, network, &req)?;
        set_id(&mut bytes, id);
        Some(bytes)
    }
}

fn error_rcode(err: &DnsError) -> ResponseCode {
    if err.is_not_found() {
        ResponseCode::NXDomain
    } else if err.matches(|e| matches!(e, DnsError::Blocked { .. })) {
        ResponseCode::Refused
    } else {
        ResponseCode::ServFail
    }
}

/// Over UDP an answer larger than the client's payload size is replaced by an
/// empty truncated one.
fn encode(mut msg: Message, network: Network, req: &Message) -> Option<Vec<u8>> {
    let bytes = msg.to_vec().ok()?;
    let limit = req
        .extensions()
        .as_ref()
        .map(|edns| usize::from(edns.max_payload()))
        .unwrap_or(MIN_UDP_PAYLOAD)
        .max(MIN_UDP_PAYLOAD);
    if network == Network::Tcp || bytes.len() <= limit {
        return Some(bytes);
    }
    msg.take_answers();
    msg.take_name_servers();
    msg.take_additionals();
    msg.set_truncated(true);
    msg.to_vec().ok()
}

/// UDP socket with `SO_REUSEPORT` so each worker gets its own receive queue.
#[cfg(unix)]
pub fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let val: libc::c_int = 1;
    // SAFETY: `val` outlives the call and the length matches its type.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if ret != 0 {
        debug!(target = "server", error = %io::Error::last_os_error(), "SO_REUSEPORT unavailable");
    }
    if let Err(e) = socket.set_recv_buffer_size(UDP_BUFFER_SIZE) {
        debug!(target = "server", error = %e, "failed to set udp recv buffer size");
    }
    if let Err(e) = socket.set_send_buffer_size(UDP_BUFFER_SIZE) {
        debug!(target = "server", error = %e, "failed to set udp send buffer size");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn run_udp_worker(worker_id: usize, socket: Arc<UdpSocket>, server: DnsServer) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        buf.clear();
        buf.reserve(4096);
        let (_, peer) = match socket.recv_buf_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                debug!(target = "server", worker_id, error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = buf.split().freeze();
        let server = server.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            if let Some(resp) = server.handle_packet(&packet, Network::Udp).await {
                let _ = socket.send_to(&resp, peer).await;
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, server: DnsServer) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, server).await {
                debug!(target = "server", peer = %peer, error = %err, "tcp connection closed");
            }
        });
    }
}

async fn handle_tcp_conn(mut stream: TcpStream, server: DnsServer) -> io::Result<()> {
    let mut len_buf = [0u8; 2];
    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(err);
        }
        let frame_len = usize::from(u16::from_be_bytes(len_buf));
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }
        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;

        let Some(resp) = server.handle_packet(&buf, Network::Tcp).await else {
            return Ok(());
        };
        let Ok(len) = u16::try_from(resp.len()) else {
            return Ok(());
        };
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&resp).await?;
    }
}

/// Binds both listeners and runs until one of them fails.
pub async fn serve(
    server: DnsServer,
    bind_udp: SocketAddr,
    bind_tcp: SocketAddr,
    udp_workers: usize,
) -> anyhow::Result<()> {
    let mut tasks = tokio::task::JoinSet::new();

    #[cfg(unix)]
    for worker_id in 0..udp_workers {
        let std_socket = create_reuseport_udp_socket(bind_udp)
            .with_context(|| format!("create udp socket for worker {worker_id}"))?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let server = server.clone();
        tasks.spawn(async move {
            if let Err(err) = run_udp_worker(worker_id, socket, server).await {
                error!(target = "server", worker_id, error = %err, "udp worker exited");
            }
        });
    }

    #[cfg(not(unix))]
    {
        let socket = Arc::new(UdpSocket::bind(bind_udp).await.context("bind udp socket")?);
        for worker_id in 0..udp_workers {
            let socket = Arc::clone(&socket);
            let server = server.clone();
            tasks.spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, server).await {
                    error!(target = "server", worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    let listener = TcpListener::bind(bind_tcp).await.context("bind tcp listener")?;
    tasks.spawn(async move {
        if let Err(err) = run_tcp(listener, server).await {
            error!(target = "server", error = %err, "tcp server exited");
        }
    });

    info!(target = "server", bind_udp = %bind_udp, bind_tcp = %bind_tcp, udp_workers, "dns server started");
    while tasks.join_next().await.is_some() {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Setting;
    use crate::fakeip::MemoryStore;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RData, RecordType};
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;
    use std::str::FromStr;

    fn server(value: serde_json::Value) -> DnsServer {
        let cfg: Setting = serde_json::from_value(value).expect("setting");
        let shunt = Shunt::new(&cfg, HashMap::new(), Arc::new(MemoryStore::new())).expect("shunt");
        DnsServer::new(Arc::new(shunt))
    }

    fn query(name: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x1234).set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        msg.to_vec().unwrap()
    }

    #[tokio::test]
    async fn hijacked_query_gets_fake_answer() {
        let s = server(json!({
            "server": { "hijack_fakeip": true },
            "dns": { "fakedns_ip_range": "10.2.0.0/24", "fakedns_skip_check_upstream": true }
        }));
        let resp = s
            .handle_packet(&query("foo.test.", RecordType::A), Network::Udp)
            .await
            .expect("response");
        let msg = Message::from_vec(&resp).unwrap();
        assert_eq!(msg.id(), 0x1234);
        assert_eq!(msg.message_type(), MessageType::Response);
        assert!(msg.recursion_desired());
        match msg.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0.octets()[..3], [10, 2, 0]),
            other => panic!("unexpected answer {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocked_domain_is_refused() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ads.example block").unwrap();
        let s = server(json!({ "bypass": { "bypass_file": file.path() } }));
        let resp = s
            .handle_packet(&query("ads.example.", RecordType::A), Network::Tcp)
            .await
            .expect("response");
        let msg = Message::from_vec(&resp).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::Refused);
        assert_eq!(msg.queries()[0].name().to_utf8(), "ads.example.");
    }

    #[tokio::test]
    async fn garbage_is_dropped() {
        let s = server(json!({}));
        assert!(s.handle_packet(&[1, 2, 3], Network::Udp).await.is_none());
    }

    #[tokio::test]
    async fn tcp_frames_round_trip() {
        let s = server(json!({
            "server": { "hijack_fakeip": true },
            "dns": { "fakedns_skip_check_upstream": true }
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_tcp(listener, s));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let q = query("bar.test.", RecordType::A);
        stream.write_all(&(q.len() as u16).to_be_bytes()).await.unwrap();
        stream.write_all(&q).await.unwrap();
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        let msg = Message::from_vec(&body).unwrap();
        assert_eq!(msg.id(), 0x1234);
        assert_eq!(msg.answers().len(), 1);
    }
}
