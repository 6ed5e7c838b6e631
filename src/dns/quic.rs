use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Connection, Endpoint, EndpointConfig, TokioRuntime};
use tracing::debug;

use super::tls;
use crate::address::{AddrContext, Address, Network};
use crate::dialer::Dialer;
use crate::error::DnsError;

/// Dials QUIC connections over sockets handed out by a [`Dialer`].
///
/// Each dial gets its own endpoint bound to a fresh datagram socket.
pub(crate) struct QuicConnector {
    server: Address,
    sni: String,
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    label: String,
}

impl QuicConnector {
    pub(crate) fn new(
        server: Address,
        tls_servername: Option<&str>,
        alpn: &[&[u8]],
        dialer: Arc<dyn Dialer>,
        label: String,
    ) -> Result<Self, DnsError> {
        let sni = match tls_servername.filter(|s| !s.is_empty()) {
            Some(name) => name.to_string(),
            None => server.hostname(),
        };
        // Validates the name early; quinn takes it as &str at dial time.
        tls::server_name(&server, Some(&sni))?;
        let crypto = QuicClientConfig::try_from(tls::client_config(alpn)?)
            .map_err(|e| DnsError::Protocol(format!("{label}: {e}")))?;
        Ok(Self {
            server,
            sni,
            config: ClientConfig::new(Arc::new(crypto)),
            dialer,
            label,
        })
    }

    pub(crate) async fn connect(&self) -> Result<(Endpoint, Connection), DnsError> {
        let io_err = |e: std::io::Error| DnsError::transport(self.label.clone(), e);
        let ctx = AddrContext::new(Network::Udp);
        let datagram = self
            .dialer
            .open_datagram(&ctx, &self.server)
            .await
            .map_err(io_err)?;
        let std_sock = datagram.socket.into_std().map_err(io_err)?;
        let local = std_sock.local_addr().map_err(io_err)?;
        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            None,
            std_sock,
            Arc::new(TokioRuntime),
        )
        .map_err(io_err)?;

        let conn = endpoint
            .connect_with(self.config.clone(), datagram.target, &self.sni)
            .map_err(|e| io_err(std::io::Error::other(e)))?
            .await
            .map_err(|e| io_err(std::io::Error::other(e)))?;
        debug!(target = "dns_quic", server = %self.label, local = %local, peer = %datagram.target,
            "quic connection established");
        Ok((endpoint, conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::dialer::ErrorDialer;

    #[tokio::test]
    async fn dial_goes_through_the_mode_dialer() {
        let connector = QuicConnector::new(
            Address::new("9.9.9.9", 853),
            Some("dns.quad9.net"),
            &[b"doq"],
            Arc::new(ErrorDialer::no_dialer(Mode::Proxy)),
            "quic://9.9.9.9:853".to_string(),
        )
        .unwrap();
        assert_eq!(connector.sni, "dns.quad9.net");

        let err = match connector.connect().await {
            Err(err) => err,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("no dialer for mode proxy"), "{err}");
    }
}
