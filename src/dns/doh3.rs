use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use h3::client::SendRequest;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Method, Uri};
use quinn::{Connection, Endpoint, VarInt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use super::doh::{DNS_MESSAGE, check_reply, parse_doh_url};
use super::quic::QuicConnector;
use super::{DEFAULT_TIMEOUT, Request, Transport};
use crate::dialer::Dialer;
use crate::error::DnsError;

type H3Sender = SendRequest<h3_quinn::OpenStreams, Bytes>;

struct Session {
    endpoint: Endpoint,
    conn: Connection,
    sender: H3Sender,
}

/// DNS over HTTP/3.
pub struct Doh3Transport {
    uri: Uri,
    label: String,
    connector: QuicConnector,
    session: Mutex<Option<Session>>,
}

impl Doh3Transport {
    pub fn new(
        host: &str,
        tls_servername: Option<&str>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, DnsError> {
        let (uri, server) = parse_doh_url(host)?;
        let label = format!("h3://{}{}", server, uri.path());
        let connector = QuicConnector::new(server, tls_servername, &[b"h3"], dialer, label.clone())?;
        Ok(Self {
            uri,
            label,
            connector,
            session: Mutex::new(None),
        })
    }

    fn h3_err(&self, e: impl std::fmt::Display) -> DnsError {
        DnsError::transport(self.label.clone(), std::io::Error::other(e.to_string()))
    }

    async fn sender(&self) -> Result<H3Sender, DnsError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.conn.close_reason().is_none() {
                return Ok(session.sender.clone());
            }
        }

        let (endpoint, conn) = self.connector.connect().await?;
        let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(conn.clone()))
            .await
            .map_err(|e| self.h3_err(e))?;
        let label = self.label.clone();
        tokio::spawn(async move {
            let res = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
            debug!(target = "dns_doh3", server = %label, result = ?res, "h3 connection closed");
        });
        *slot = Some(Session {
            endpoint,
            conn,
            sender: sender.clone(),
        });
        Ok(sender)
    }

    async fn exchange(&self, question: Bytes) -> Result<Bytes, DnsError> {
        let mut sender = self.sender().await?;
        let request = http::Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(())
            .map_err(|e| DnsError::Protocol(e.to_string()))?;

        let mut stream = sender.send_request(request).await.map_err(|e| self.h3_err(e))?;
        stream.send_data(question).await.map_err(|e| self.h3_err(e))?;
        stream.finish().await.map_err(|e| self.h3_err(e))?;

        let resp = stream.recv_response().await.map_err(|e| self.h3_err(e))?;
        let mut body = BytesMut::new();
        while let Some(mut chunk) = stream.recv_data().await.map_err(|e| self.h3_err(e))? {
            body.extend_from_slice(&chunk.copy_to_bytes(chunk.remaining()));
        }
        check_reply(&self.label, resp.status(), body.freeze())
    }
}

#[async_trait]
impl Transport for Doh3Transport {
    async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
        timeout(DEFAULT_TIMEOUT, self.exchange(req.question.clone()))
            .await
            .map_err(|_| DnsError::timeout(self.label.clone()))?
    }

    fn name(&self) -> &str {
        &self.label
    }

    async fn close(&self) -> Result<(), DnsError> {
        if let Some(session) = self.session.lock().await.take() {
            session.conn.close(VarInt::from_u32(0), b"");
            session.endpoint.close(VarInt::from_u32(0), b"");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;

    #[test]
    fn label_and_uri_follow_doh_rules() {
        let t = Doh3Transport::new("dns.google", None, Arc::new(DirectDialer::new(None))).unwrap();
        assert_eq!(t.name(), "h3://dns.google:443/dns-query");
        assert_eq!(t.uri.to_string(), "https://dns.google/dns-query");
    }
}
