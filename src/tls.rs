//! TLS plumbing for interception
//!
//! The client-facing side presents leaf certificates issued on demand from the
//! loaded CA, picked by SNI with the CONNECT host as fallback. The upstream side
//! verifies origins against the webpki root store.
//!
//! ALPN is pinned to `http/1.1` in both directions. The exchange pipeline only
//! speaks HTTP/1.1, so an `h2` negotiation would break the session.

use crate::certificate::CaMaterial;
use crate::error::{Error, Result};
use once_cell::sync::OnceCell;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, trace};

const HTTP11: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Picks a leaf for each ClientHello
pub struct LeafResolver {
    ca: Arc<CaMaterial>,
    fallback_host: Option<String>,
}

impl LeafResolver {
    pub fn new(ca: Arc<CaMaterial>, fallback_host: Option<String>) -> Self {
        Self { ca, fallback_host }
    }
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .map(str::to_string)
            .or_else(|| self.fallback_host.clone())?;

        trace!("Resolving leaf certificate for {}", host);

        match self.ca.certified_key(&host) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Failed to issue certificate for {}: {}", host, e);
                None
            }
        }
    }
}

impl fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafResolver")
            .field("fallback_host", &self.fallback_host)
            .field("cached_leaves", &self.ca.cached_leaf_count())
            .finish()
    }
}

/// Acceptor for one intercepted client connection
pub fn acceptor(ca: Arc<CaMaterial>, fallback_host: Option<String>) -> Result<TlsAcceptor> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::internal(format!("failed to build TLS server config: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(LeafResolver::new(ca, fallback_host)));
    config.alpn_protocols = vec![HTTP11.to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

static CONNECTOR: OnceCell<TlsConnector> = OnceCell::new();

/// Shared connector for origin servers
pub fn upstream_connector() -> Result<TlsConnector> {
    CONNECTOR
        .get_or_try_init(|| {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            let mut config = ClientConfig::builder_with_provider(provider())
                .with_safe_default_protocol_versions()
                .map_err(|e| Error::internal(format!("failed to build TLS client config: {}", e)))?
                .with_root_certificates(roots)
                .with_no_client_auth();
            config.alpn_protocols = vec![HTTP11.to_vec()];
            Ok(TlsConnector::from(Arc::new(config)))
        })
        .cloned()
}

/// Server name used for SNI and certificate verification toward the origin
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::invalid_argument(format!("invalid TLS server name: {}", host)))
}
