use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{Connection, Endpoint, VarInt};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::quic::QuicConnector;
use super::{DEFAULT_TIMEOUT, Request, Transport, parse_server_addr};
use crate::dialer::Dialer;
use crate::error::DnsError;
use crate::proto_utils::set_id;

const MAX_REPLY: usize = 65535 + 2;

/// DNS over QUIC (port 784). One stream per question; the message id on the
/// wire is zero and restored on the reply.
pub struct DoqTransport {
    label: String,
    connector: QuicConnector,
    conn: Mutex<Option<(Endpoint, Connection)>>,
}

impl DoqTransport {
    pub fn new(
        host: &str,
        tls_servername: Option<&str>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, DnsError> {
        let server = parse_server_addr(host, 784)?;
        let label = format!("quic://{server}");
        let connector = QuicConnector::new(server, tls_servername, &[b"doq"], dialer, label.clone())?;
        Ok(Self {
            label,
            connector,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<Connection, DnsError> {
        let mut slot = self.conn.lock().await;
        if let Some((_, conn)) = slot.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }
        let (endpoint, conn) = self.connector.connect().await?;
        *slot = Some((endpoint, conn.clone()));
        Ok(conn)
    }

    async fn exchange(&self, req: &Request) -> Result<Bytes, DnsError> {
        let conn = self.connection().await?;
        let stream_err = |e: String| {
            DnsError::transport(self.label.clone(), std::io::Error::other(e))
        };

        let (mut send, mut recv) = conn.open_bi().await.map_err(|e| stream_err(e.to_string()))?;
        let len = u16::try_from(req.question.len())
            .map_err(|_| DnsError::Protocol("dns message too large".to_string()))?;
        let mut frame = Vec::with_capacity(req.question.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&req.question);
        set_id(&mut frame[2..], 0);
        send.write_all(&frame).await.map_err(|e| stream_err(e.to_string()))?;
        send.finish().map_err(|e| stream_err(e.to_string()))?;

        let reply = recv
            .read_to_end(MAX_REPLY)
            .await
            .map_err(|e| stream_err(e.to_string()))?;
        if reply.len() < 2 {
            return Err(DnsError::Protocol(format!("{}: short reply", self.label)));
        }
        let len = u16::from_be_bytes([reply[0], reply[1]]) as usize;
        let mut body = reply
            .get(2..2 + len)
            .ok_or_else(|| DnsError::Protocol(format!("{}: truncated reply", self.label)))?
            .to_vec();
        set_id(&mut body, req.id);
        Ok(Bytes::from(body))
    }
}

#[async_trait]
impl Transport for DoqTransport {
    async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
        timeout(DEFAULT_TIMEOUT, self.exchange(req))
            .await
            .map_err(|_| DnsError::timeout(self.label.clone()))?
    }

    fn name(&self) -> &str {
        &self.label
    }

    async fn close(&self) -> Result<(), DnsError> {
        if let Some((endpoint, conn)) = self.conn.lock().await.take() {
            conn.close(VarInt::from_u32(0), b"");
            endpoint.close(VarInt::from_u32(0), b"");
        }
        Ok(())
    }
}
