//! Transparent listener support
//!
//! Redirected connections never send CONNECT, so the origin is recovered from
//! the socket through a [`DestinationResolver`]. The default resolver reads
//! `SO_ORIGINAL_DST` as set by iptables/nftables REDIRECT rules.

use crate::config::ProxyConfig;
use crate::proxy::{self, Session, SessionState, TunnelTarget};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Recovers where a redirected connection was originally headed
#[async_trait]
pub trait DestinationResolver: Send + Sync + fmt::Debug {
    async fn resolve_original_destination(&self, stream: &TcpStream) -> io::Result<SocketAddr>;
}

/// Netfilter `SO_ORIGINAL_DST` lookup
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDestinationResolver;

#[async_trait]
impl DestinationResolver for SystemDestinationResolver {
    #[cfg(target_os = "linux")]
    async fn resolve_original_destination(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        let socket = socket2::SockRef::from(stream);
        let original = if stream.local_addr()?.is_ipv6() {
            socket.original_dst_ipv6()?
        } else {
            socket.original_dst()?
        };
        original
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "original destination is not an inet address"))
    }

    #[cfg(not(target_os = "linux"))]
    async fn resolve_original_destination(&self, _stream: &TcpStream) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "original destination lookup is only available on Linux",
        ))
    }
}

/// Always answers with the same address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticDestination(pub SocketAddr);

#[async_trait]
impl DestinationResolver for StaticDestination {
    async fn resolve_original_destination(&self, _stream: &TcpStream) -> io::Result<SocketAddr> {
        Ok(self.0)
    }
}

/// True when `destination` would send the connection back into the listener
fn is_self_loop(destination: SocketAddr, local: SocketAddr) -> bool {
    if destination == local {
        return true;
    }
    let dest_ip = destination.ip().to_canonical();
    let local_ip = local.ip().to_canonical();
    destination.port() == local.port()
        && (dest_ip == local_ip || dest_ip.is_unspecified() || (dest_ip.is_loopback() && local_ip.is_loopback()))
}

pub(crate) async fn session(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    shutdown: watch::Receiver<bool>,
) {
    let mut session = Session::new(peer);
    let result = run(stream, &mut session, config, shutdown).await;
    session.finish(result);
}

async fn run(
    stream: TcpStream,
    session: &mut Session,
    config: Arc<ProxyConfig>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    session.transition(SessionState::TransparentResolve);
    let destination = config
        .resolver
        .resolve_original_destination(&stream)
        .await
        .context("failed to resolve original destination")?;
    let local = stream.local_addr().context("failed to read listener address")?;

    if is_self_loop(destination, local) {
        warn!("Dropping transparent connection that targets the proxy itself ({})", destination);
        return Err(anyhow!("original destination {} is the transparent listener", destination));
    }
    debug!("Transparent connection from {:?} to {}", stream.peer_addr().ok(), destination);

    session.transition(SessionState::ConnectEstablished);
    let target = TunnelTarget {
        host: destination.ip().to_canonical().to_string(),
        port: destination.port(),
        connect_addr: Some(destination),
        transparent: true,
    };
    proxy::intercept(stream, target, session, config, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_self_loop_detection() {
        let local = addr("127.0.0.1:8889");
        assert!(is_self_loop(addr("127.0.0.1:8889"), local));
        assert!(is_self_loop(addr("127.0.0.2:8889"), local));
        assert!(is_self_loop(addr("0.0.0.0:8889"), local));
        assert!(is_self_loop(addr("[::ffff:127.0.0.1]:8889"), local));
        assert!(!is_self_loop(addr("127.0.0.1:8080"), local));
        assert!(!is_self_loop(addr("93.184.216.34:8889"), local));
    }

    #[tokio::test]
    async fn test_static_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let resolver = StaticDestination(addr("10.1.2.3:443"));
        assert_eq!(
            resolver.resolve_original_destination(&client).await.unwrap(),
            addr("10.1.2.3:443")
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_system_resolver_fails_without_redirect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        assert!(SystemDestinationResolver
            .resolve_original_destination(&accepted)
            .await
            .is_err());
        drop(client);
    }
}
