//! Connections from the proxy to origin servers

use crate::tls;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Body type flowing through the proxy in both directions
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where a request is sent
///
/// `host` is used for DNS, SNI and certificate verification unless
/// `connect_addr` pins the socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub connect_addr: Option<SocketAddr>,
}

impl UpstreamTarget {
    /// `host[:port]` as sent in the Host header
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())?;
        if let Some(addr) = self.connect_addr {
            write!(f, " via {}", addr)?;
        }
        Ok(())
    }
}

async fn connect_tcp(target: &UpstreamTarget) -> Result<TcpStream> {
    let connect = async {
        match target.connect_addr {
            Some(addr) => TcpStream::connect(addr).await,
            None => TcpStream::connect((target.host.as_str(), target.port)).await,
        }
    };
    let stream = timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", target))?
        .with_context(|| format!("failed to connect to {}", target))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

async fn handshake<T>(io: T, target: &UpstreamTarget) -> Result<SendRequest<ProxyBody>>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .handshake(TokioIo::new(io))
        .await
        .with_context(|| format!("HTTP handshake with {} failed", target))?;

    let label = target.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upstream connection {} closed: {}", label, e);
        }
    });

    Ok(sender)
}

/// Open a new HTTP/1.1 connection to `target`
pub async fn connect(target: &UpstreamTarget) -> Result<SendRequest<ProxyBody>> {
    let stream = connect_tcp(target).await?;
    match target.scheme {
        Scheme::Http => handshake(stream, target).await,
        Scheme::Https => {
            let name = tls::server_name(&target.host)?;
            let connector = tls::upstream_connector()?;
            let tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(name, stream))
                .await
                .map_err(|_| anyhow!("TLS handshake with {} timed out", target))?
                .with_context(|| format!("TLS handshake with {} failed", target))?;
            handshake(tls_stream, target).await
        }
    }
}

/// Open a raw TCP connection, used by opaque tunnels
pub async fn connect_raw(target: &UpstreamTarget) -> Result<TcpStream> {
    connect_tcp(target).await
}

/// Upstream connections reused across the exchanges of one session
#[derive(Clone, Default)]
pub struct UpstreamPool {
    senders: Arc<Mutex<HashMap<UpstreamTarget, SendRequest<ProxyBody>>>>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, target: &UpstreamTarget) -> Option<SendRequest<ProxyBody>> {
        self.senders.lock().remove(target)
    }

    fn put(&self, target: UpstreamTarget, sender: SendRequest<ProxyBody>) {
        self.senders.lock().insert(target, sender);
    }

    /// Send `request`, reusing an idle connection to the same target
    pub async fn send(&self, target: &UpstreamTarget, request: Request<ProxyBody>) -> Result<Response<Incoming>> {
        let reused = match self.take(target) {
            Some(mut sender) if !sender.is_closed() => match sender.ready().await {
                Ok(()) => Some(sender),
                Err(_) => None,
            },
            _ => None,
        };

        let mut sender = match reused {
            Some(sender) => sender,
            None => {
                let mut sender = connect(target).await?;
                sender
                    .ready()
                    .await
                    .with_context(|| format!("connection to {} closed before use", target))?;
                sender
            }
        };

        let response = sender
            .send_request(request)
            .await
            .with_context(|| format!("request to {} failed", target))?;

        // A switched connection belongs to the upgrade from now on.
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            self.put(target.clone(), sender);
        }
        Ok(response)
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for UpstreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamPool").field("idle", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(scheme: Scheme, host: &str, port: u16) -> UpstreamTarget {
        UpstreamTarget {
            scheme,
            host: host.to_string(),
            port,
            connect_addr: None,
        }
    }

    #[test]
    fn test_authority_omits_default_port() {
        assert_eq!(target(Scheme::Https, "example.com", 443).authority(), "example.com");
        assert_eq!(target(Scheme::Http, "example.com", 8080).authority(), "example.com:8080");
        assert_eq!(target(Scheme::Http, "::1", 8080).authority(), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect(&target(Scheme::Http, "127.0.0.1", port)).await.err().unwrap();
        assert!(err.to_string().contains("127.0.0.1"));
    }
}
