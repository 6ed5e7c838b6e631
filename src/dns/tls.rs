use std::sync::Arc;

use rustls::ClientConfig;
use rustls::pki_types::ServerName;

use crate::address::Address;
use crate::error::DnsError;

/// Client config on the ring provider trusting the webpki roots, advertising `alpn`.
pub(crate) fn client_config(alpn: &[&[u8]]) -> Result<Arc<ClientConfig>, DnsError> {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| DnsError::Protocol(format!("tls config: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// SNI for `server`: the explicit override, else the server's own host.
pub(crate) fn server_name(
    server: &Address,
    override_name: Option<&str>,
) -> Result<ServerName<'static>, DnsError> {
    let host = match override_name.filter(|s| !s.is_empty()) {
        Some(name) => name.to_string(),
        None => server.hostname(),
    };
    ServerName::try_from(host.clone())
        .map_err(|e| DnsError::Protocol(format!("invalid tls server name {host}: {e}")))
}
