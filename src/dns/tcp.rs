use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::{DEFAULT_TIMEOUT, Request, Transport, parse_server_addr};
use crate::address::{AddrContext, Address, Network};
use crate::dialer::Dialer;
use crate::error::DnsError;

/// Writes one length-prefixed message and reads one length-prefixed reply.
pub(crate) async fn exchange_framed<S>(stream: &mut S, question: &[u8]) -> std::io::Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(question.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "dns message too large")
    })?;
    let mut frame = Vec::with_capacity(question.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(question);
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// DNS over TCP, one connection per request.
pub struct TcpTransport {
    server: Address,
    label: String,
    dialer: Arc<dyn Dialer>,
}

impl TcpTransport {
    pub fn new(host: &str, dialer: Arc<dyn Dialer>) -> Result<Self, DnsError> {
        let server = parse_server_addr(host, 53)?;
        Ok(Self {
            label: format!("tcp://{server}"),
            server,
            dialer,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
        let exchange = async {
            let ctx = AddrContext::new(Network::Tcp);
            let mut stream = self.dialer.connect_stream(&ctx, &self.server).await?;
            exchange_framed(&mut stream, &req.question).await
        };
        match timeout(DEFAULT_TIMEOUT, exchange).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(DnsError::transport(self.label.clone(), e)),
            Err(_) => Err(DnsError::timeout(self.label.clone())),
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}
