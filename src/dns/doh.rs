use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::{DEFAULT_TIMEOUT, Request, Transport, parse_server_addr, tls};
use crate::address::{AddrContext, Address, Network};
use crate::dialer::Dialer;
use crate::error::DnsError;

pub(crate) const DNS_MESSAGE: &str = "application/dns-message";
const MAX_BODY: usize = 65535;

/// Adds `https://` when no scheme is given and `/dns-query` when no path is.
/// Returns the request URI and the server address.
pub(crate) fn parse_doh_url(host: &str) -> Result<(Uri, Address), DnsError> {
    let host = host.trim();
    let with_scheme = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    };
    let rest = with_scheme
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or_default();
    let (authority, path) = match rest.find('/') {
        Some(idx) if idx + 1 < rest.len() => (&rest[..idx], &rest[idx..]),
        Some(idx) => (&rest[..idx], "/dns-query"),
        None => (rest, "/dns-query"),
    };
    let server = parse_server_addr(authority, 443)?;
    let uri = format!("https://{authority}{path}")
        .parse::<Uri>()
        .map_err(|e| DnsError::Protocol(format!("invalid doh url {host}: {e}")))?;
    Ok((uri, server))
}

/// Checks status and body size of a DoH reply.
pub(crate) fn check_reply(label: &str, status: StatusCode, body: Bytes) -> Result<Bytes, DnsError> {
    if status != StatusCode::OK {
        return Err(DnsError::Protocol(format!("{label}: http status {status}")));
    }
    if body.is_empty() || body.len() > MAX_BODY {
        return Err(DnsError::Protocol(format!(
            "{label}: invalid body length {}",
            body.len()
        )));
    }
    Ok(body)
}

/// DNS over HTTPS via HTTP/2 POST. One connection is kept and redialed once it closes.
pub struct DohTransport {
    uri: Uri,
    server: Address,
    label: String,
    sni: ServerName<'static>,
    connector: TlsConnector,
    dialer: Arc<dyn Dialer>,
    sender: Mutex<Option<SendRequest<Full<Bytes>>>>,
}

impl DohTransport {
    pub fn new(
        host: &str,
        tls_servername: Option<&str>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, DnsError> {
        let (uri, server) = parse_doh_url(host)?;
        let sni = tls::server_name(&server, tls_servername)?;
        Ok(Self {
            label: uri.to_string(),
            uri,
            server,
            sni,
            connector: TlsConnector::from(tls::client_config(&[b"h2"])?),
            dialer,
            sender: Mutex::new(None),
        })
    }

    async fn sender(&self) -> Result<SendRequest<Full<Bytes>>, DnsError> {
        let mut slot = self.sender.lock().await;
        if let Some(sender) = slot.as_ref() {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }

        let io_err = |e: std::io::Error| DnsError::transport(self.label.clone(), e);
        let ctx = AddrContext::new(Network::Tcp);
        let stream = self
            .dialer
            .connect_stream(&ctx, &self.server)
            .await
            .map_err(io_err)?;
        let tls = self
            .connector
            .connect(self.sni.clone(), stream)
            .await
            .map_err(io_err)?;
        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
            .await
            .map_err(|e| io_err(std::io::Error::other(e)))?;

        let label = self.label.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(target = "dns_doh", server = %label, error = %e, "connection closed");
            }
        });
        *slot = Some(sender.clone());
        Ok(sender)
    }

    async fn exchange(&self, question: Bytes) -> Result<Bytes, DnsError> {
        let mut sender = self.sender().await?;
        let request = http::Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(Full::new(question))
            .map_err(|e| DnsError::Protocol(e.to_string()))?;

        let hyper_err = |e: hyper::Error| DnsError::transport(self.label.clone(), std::io::Error::other(e));
        let resp = match sender.send_request(request).await {
            Ok(resp) => resp,
            Err(e) => {
                self.sender.lock().await.take();
                return Err(hyper_err(e));
            }
        };
        let status = resp.status();
        let body = resp.into_body().collect().await.map_err(hyper_err)?.to_bytes();
        check_reply(&self.label, status, body)
    }
}

#[async_trait]
impl Transport for DohTransport {
    async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
        match timeout(DEFAULT_TIMEOUT, self.exchange(req.question.clone())).await {
            Ok(res) => res,
            Err(_) => {
                warn!(target = "dns_doh", server = %self.label, name = %req.name, "request timed out");
                Err(DnsError::timeout(self.label.clone()))
            }
        }
    }

    fn name(&self) -> &str {
        &self.label
    }

    async fn close(&self) -> Result<(), DnsError> {
        self.sender.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_gets_scheme_and_default_path() {
        let (uri, server) = parse_doh_url("dns.google").unwrap();
        assert_eq!(uri.to_string(), "https://dns.google/dns-query");
        assert_eq!(server.to_string(), "dns.google:443");

        let (uri, server) = parse_doh_url("https://1.1.1.1:8443/custom").unwrap();
        assert_eq!(uri.to_string(), "https://1.1.1.1:8443/custom");
        assert_eq!(server.port(), 8443);

        let (uri, _) = parse_doh_url("https://dns.example/").unwrap();
        assert_eq!(uri.path(), "/dns-query");
    }

    #[test]
    fn reply_checks_status_and_length() {
        assert!(check_reply("t", StatusCode::BAD_GATEWAY, Bytes::from_static(b"x")).is_err());
        assert!(check_reply("t", StatusCode::OK, Bytes::new()).is_err());
        assert!(check_reply("t", StatusCode::OK, Bytes::from(vec![0u8; 65536])).is_err());
        assert!(check_reply("t", StatusCode::OK, Bytes::from_static(b"\0\0")).is_ok());
    }
}
