use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::address::{AddrContext, Address};
use crate::config::Mode;
use crate::dns::{LookupOptions, Resolver};
use crate::error::DnsError;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// An unconnected datagram socket plus the resolved peer it should talk to.
#[derive(Debug)]
pub struct Datagram {
    pub socket: UdpSocket,
    pub target: SocketAddr,
}

/// Opens streams and datagram sockets towards an address.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect_stream(&self, ctx: &AddrContext, addr: &Address) -> io::Result<BoxStream>;
    async fn open_datagram(&self, ctx: &AddrContext, addr: &Address) -> io::Result<Datagram>;
}

/// Resolves a domain target through the context's bound resolver, else `fallback`.
pub async fn resolve_target(
    ctx: &AddrContext,
    addr: &Address,
    fallback: Option<&dyn Resolver>,
) -> io::Result<SocketAddr> {
    if let Some(sa) = addr.socket_addr() {
        return Ok(sa);
    }
    let host = addr.hostname();
    let resolver: &dyn Resolver = match (ctx.resolver.as_deref(), fallback) {
        (Some(r), _) => r,
        (None, Some(r)) => r,
        (None, None) => {
            return Err(DnsError::Uninitialized { name: "bootstrap".to_string() }.into());
        }
    };
    let opts = LookupOptions {
        strategy: ctx.resolve_strategy,
    };
    let ips = resolver.lookup_ip(&host, &opts).await?;
    let ip = ips
        .preferred(ctx.resolve_strategy)
        .ok_or_else(|| io::Error::from(DnsError::not_found(host.clone())))?;
    debug!(target = "dialer", host = %host, ip = %ip, resolver = resolver.name(), "resolved target");
    Ok(SocketAddr::new(ip, addr.port()))
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UDP_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Plain sockets from this host. Domain targets are resolved via the context's
/// resolver or the bootstrap resolver.
pub struct DirectDialer {
    bootstrap: Option<Arc<dyn Resolver>>,
}

impl DirectDialer {
    pub fn new(bootstrap: Option<Arc<dyn Resolver>>) -> Self {
        Self { bootstrap }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn connect_stream(&self, ctx: &AddrContext, addr: &Address) -> io::Result<BoxStream> {
        let target = resolve_target(ctx, addr, self.bootstrap.as_deref()).await?;
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect {target} timeout")))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target = "dialer", target_addr = %target, error = %e, "set_nodelay failed");
        }
        Ok(Box::new(stream))
    }

    async fn open_datagram(&self, ctx: &AddrContext, addr: &Address) -> io::Result<Datagram> {
        let target = resolve_target(ctx, addr, self.bootstrap.as_deref()).await?;
        let socket = bind_udp(target)?;
        Ok(Datagram { socket, target })
    }
}

/// Binds an ephemeral UDP socket of the target's family with enlarged buffers.
pub fn bind_udp(target: SocketAddr) -> io::Result<UdpSocket> {
    let (domain, local) = match target.ip() {
        IpAddr::V4(_) => (Domain::IPV4, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
        IpAddr::V6(_) => (Domain::IPV6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(UDP_BUFFER_SIZE) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(UDP_BUFFER_SIZE) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Always fails; stands in for a mode that has no dialer or is blocked.
pub struct ErrorDialer {
    error: DnsError,
}

impl ErrorDialer {
    pub fn no_dialer(mode: Mode) -> Self {
        Self {
            error: DnsError::NoDialer { mode },
        }
    }

    pub fn blocked() -> Self {
        Self {
            error: DnsError::Blocked {
                host: String::new(),
            },
        }
    }

    fn error_for(&self, addr: &Address) -> io::Error {
        match &self.error {
            DnsError::Blocked { .. } => DnsError::Blocked {
                host: addr.to_string(),
            }
            .into(),
            other => other.clone().into(),
        }
    }
}

#[async_trait]
impl Dialer for ErrorDialer {
    async fn connect_stream(&self, _ctx: &AddrContext, addr: &Address) -> io::Result<BoxStream> {
        Err(self.error_for(addr))
    }

    async fn open_datagram(&self, _ctx: &AddrContext, addr: &Address) -> io::Result<Datagram> {
        Err(self.error_for(addr))
    }
}
