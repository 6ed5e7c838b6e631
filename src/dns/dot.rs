use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::tcp::exchange_framed;
use super::{DEFAULT_TIMEOUT, Request, Transport, parse_server_addr, tls};
use crate::address::{AddrContext, Address, Network};
use crate::dialer::Dialer;
use crate::error::DnsError;

/// DNS over TLS (port 853), one TLS session per request.
pub struct DotTransport {
    server: Address,
    label: String,
    sni: ServerName<'static>,
    connector: TlsConnector,
    dialer: Arc<dyn Dialer>,
}

impl DotTransport {
    pub fn new(
        host: &str,
        tls_servername: Option<&str>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, DnsError> {
        let server = parse_server_addr(host, 853)?;
        let sni = tls::server_name(&server, tls_servername)?;
        Ok(Self {
            label: format!("tls://{server}"),
            server,
            sni,
            connector: TlsConnector::from(tls::client_config(&[])?),
            dialer,
        })
    }
}

#[async_trait]
impl Transport for DotTransport {
    async fn send(&self, req: &Request) -> Result<Bytes, DnsError> {
        let exchange = async {
            let ctx = AddrContext::new(Network::Tcp);
            let stream = self.dialer.connect_stream(&ctx, &self.server).await?;
            let mut tls = self.connector.connect(self.sni.clone(), stream).await?;
            exchange_framed(&mut tls, &req.question).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;

    #[test]
    fn default_port_and_label() {
        let t = DotTransport::new("1.1.1.1", Some("cloudflare-dns.com"), Arc::new(DirectDialer::new(None)))
            .unwrap();
        assert_eq!(t.name(), "tls://1.1.1.1:853");
    }

    #[test]
    fn rejects_invalid_server_name() {
        let err = DotTransport::new("1.1.1.1", Some("bad name!"), Arc::new(DirectDialer::new(None)));
        assert!(err.is_err());
    }
}
