use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::tcp::TcpTransport;
use super::{DEFAULT_TIMEOUT, Request, Transport, parse_server_addr};
use crate::address::{AddrContext, Address, Network};
use crate::dialer::Dialer;
use crate::error::DnsError;
use crate::proto_utils::{is_truncated, parse_head};

/// The shared socket is torn down after this long without a reply.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_UDP_PACKET: usize = 65535;

/// (id, lowercase name, qtype)
type PendingKey = (u16, String, u16);
type Pending = DashMap<PendingKey, oneshot::Sender<Bytes>, FxBuildHasher>;

struct Conn {
    socket: UdpSocket,
    target: SocketAddr,
    cancel: CancellationToken,
}

struct State {
    conn: Mutex<Option<Arc<Conn>>>,
    pending: Pending,
}

/// DNS over UDP. All in-flight questions share one socket; replies are routed
/// back by id, name and type. Truncated replies are retried over TCP.
pub struct UdpTransport {
    server: Address,
    label: String,
    dialer: Arc<dyn Dialer>,
    fallback: TcpTransport,
    state: Arc<State>,
}

impl UdpTransport {
    pub fn new(host: &str, dialer: Arc<dyn Dialer>) -> Result<Self, DnsError> {
        let server = parse_server_addr(host, 53)?;
        let fallback = TcpTransport::new(&server.to_string(), dialer.clone())?;
        Ok(Self {
            label: format!("udp://{server}"),
            server,
            dialer,
            fallback,
            state: Arc::new(State {
                conn: Mutex::new(None),
                pending: DashMap::with_hasher(FxBuildHasher),
            }),
        })
    }

    async fn conn(&self) -> Result<Arc<Conn>, DnsError> {
        let mut slot = self.state.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.cancel.is_cancelled() {
                return Ok(conn.clone());
            }
        }

        let ctx = AddrContext::new(Network::Udp);
        let datagram = self
            .dialer
            .open_datagram(&ctx, &self.server)
            .await
            .map_err(|e| DnsError::transport(self.label.clone(), e))?;
        let conn = Arc::new(Conn {
            socket: datagram.socket,
            target: datagram.target,
            cancel: CancellationToken::new(),
        });
        debug!(target = "dns_udp", server = %self.label, peer = %conn.target, "opened shared socket");
        tokio::spawn(read_loop(self.state.clone(), conn.clone(), self.label.clone()));
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn send_udp(&self, req: &Request) -> Result<Bytes, DnsError> {
        let conn = self.conn().await?;
        let key: PendingKey = (req.id, req.name.clone(), u16::from(req.qtype));
        let (tx, rx) = oneshot::channel();
        self.state.pending.insert(key.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.state.pending,
            key,
        };

        conn.socket
            .send_to(&req.question, conn.target)
            .await
            .map_err(|e| DnsError::transport(self.label.clone(), e))?;

        match timeout(DEFAULT_TIMEOUT, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(DnsError::transport(
                self.label.clone(),
                std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "socket closed"),
            )),
            Err(_) => Err(DnsError::timeout(self.label.clone())),
        }
    }
}

/// Drops the pending slot when the caller finishes or is canceled.
struct PendingGuard<'a> {
    pending: &'a Pending,
    key: PendingKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

async fn read_loop(state: Arc<State>, conn: Arc<Conn>, label: String) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    let mut name_buf = [0u8; 256];
    loop {
        let recv = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            r = timeout(IDLE_TIMEOUT, conn.socket.recv_from(&mut buf)) => r,
        };
        let (n, from) = match recv {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                debug!(target = "dns_udp", server = %label, error = %e, "shared socket read failed");
                break;
            }
            Err(_) => {
                if state.pending.is_empty() {
                    debug!(target = "dns_udp", server = %label, "shared socket idle, closing");
                    break;
                }
                continue;
            }
        };
        if from != conn.target {
            trace!(target = "dns_udp", server = %label, from = %from, "ignore stray packet");
            continue;
        }
        let packet = &buf[..n];
        let Some(head) = parse_head(packet, &mut name_buf) else {
            continue;
        };
        let key = (head.id, head.qname.to_string(), head.qtype);
        if let Some((_, tx)) = state.pending.remove(&key) {
            let _ = tx.send(Bytes::copy_from_slice(packet));
        }
    }

    conn.cancel.cancel();
    let mut slot = state.conn.lock().await;
    if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn)) {
        *slot = None;
        state.pending.clear();
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
        if req.truncated {
            return self.fallback.send(req).await;
        }
        let bytes = self.send_udp(req).await?;
        if is_truncated(&bytes) {
            debug!(target = "dns_udp", server = %self.label, name = %req.name, "truncated, retry over tcp");
            let retry = Request {
                truncated: true,
                ..req.clone()
            };
            return self.fallback.send(&retry).await;
        }
        Ok(bytes)
    }

    fn name(&self) -> &str {
        &self.label
    }

    async fn close(&self) -> Result<(), DnsError> {
        if let Some(conn) = self.state.conn.lock().await.take() {
            conn.cancel.cancel();
        }
        Ok(())
    }
}
