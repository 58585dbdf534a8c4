//! Listeners and per-connection sessions
//!
//! Each accepted socket becomes one task in the listener's `JoinSet`. A session
//! reads a single configuration snapshot, checks the client allowlist and then
//! walks through [`SessionState`] until the client or the origin goes away.

use crate::config::{ConfigStore, ProxyConfig};
use crate::exchange::{self, empty_body, text_response, ExchangeContext, Route};
use crate::rewind::Rewind;
use crate::throttle::{delay_before_forward, ShapedStream};
use crate::tls;
use crate::transparent;
use crate::upstream::{self, ProxyBody, Scheme, UpstreamPool, UpstreamTarget};
use anyhow::{anyhow, Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// First byte of a TLS handshake record
const TLS_HANDSHAKE: u8 = 0x16;
/// How long sessions may keep running after stop
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const CLIENT_TLS_TIMEOUT: Duration = Duration::from_secs(15);

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    TransparentResolve,
    ConnectEstablished,
    TlsHandshaking,
    Relaying,
    Closed,
    Errored,
}

#[derive(Debug)]
pub(crate) struct Session {
    id: u64,
    peer: SocketAddr,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(peer: SocketAddr) -> Self {
        let id = SESSION_IDS.fetch_add(1, Ordering::Relaxed);
        trace!("Session {} accepted from {}", id, peer);
        Self {
            id,
            peer,
            state: SessionState::Accepted,
        }
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        trace!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn finish(mut self, result: Result<()>) {
        let last = self.state();
        match result {
            Ok(()) => self.transition(SessionState::Closed),
            Err(e) => {
                self.transition(SessionState::Errored);
                debug!("Session {} from {} failed while {:?}: {:#}", self.id, self.peer, last, e);
            }
        }
    }
}

/// Origin of an established tunnel
#[derive(Debug, Clone)]
pub(crate) struct TunnelTarget {
    pub host: String,
    pub port: u16,
    pub connect_addr: Option<SocketAddr>,
    /// Transparent connections name the origin by SNI or Host header
    pub transparent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerKind {
    Explicit,
    Transparent,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Explicit => f.write_str("proxy"),
            ListenerKind::Transparent => f.write_str("transparent"),
        }
    }
}

/// Resolves once stop has been requested or the controller is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Accept loop of one listener; returns after stop once sessions are drained
pub(crate) async fn run_listener(
    listener: TcpListener,
    kind: ListenerKind,
    store: Arc<ConfigStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local_addr = listener.local_addr().ok();
    info!("{} listener accepting on {:?}", kind, local_addr);

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let config = store.snapshot();
                    if !config.client_allowlist.admit(peer.ip()) {
                        warn!("LAN_ACCESS_REQUEST ip={}", peer.ip().to_canonical());
                        drop(stream);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let session_shutdown = shutdown.clone();
                    match kind {
                        ListenerKind::Explicit => {
                            sessions.spawn(explicit_session(stream, peer, config, session_shutdown));
                        }
                        ListenerKind::Transparent => {
                            sessions.spawn(transparent::session(stream, peer, config, session_shutdown));
                        }
                    }
                }
                Err(e) => {
                    warn!("{} listener accept failed: {}", kind, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("{} session panicked: {}", kind, e);
                    }
                }
            }
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    drop(listener);
    info!("{} listener closed, {} sessions still running", kind, sessions.len());
    drain(sessions, kind).await;
}

async fn drain(mut sessions: JoinSet<()>, kind: ListenerKind) {
    let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = sessions.join_next() => {
                if joined.is_none() {
                    return;
                }
            }
            _ = &mut deadline => {
                warn!("Aborting {} {} sessions after grace period", sessions.len(), kind);
                sessions.abort_all();
                while sessions.join_next().await.is_some() {}
                return;
            }
        }
    }
}

struct PendingTunnel {
    upgrade: OnUpgrade,
    host: String,
    port: u16,
}

type TunnelSlot = Arc<Mutex<Option<PendingTunnel>>>;

fn accept_connect(req: &mut Request<Incoming>, slot: &TunnelSlot) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return text_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
    };
    let host = authority.host();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_ascii_lowercase();
    if host.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
    }

    *slot.lock() = Some(PendingTunnel {
        upgrade: hyper::upgrade::on(req),
        host,
        port: authority.port_u16().unwrap_or(443),
    });
    Response::new(empty_body())
}

async fn explicit_session(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    shutdown: watch::Receiver<bool>,
) {
    let mut session = Session::new(peer);
    let result = run_explicit(stream, &mut session, config, shutdown).await;
    session.finish(result);
}

async fn run_explicit(
    stream: TcpStream,
    session: &mut Session,
    config: Arc<ProxyConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let ctx = Arc::new(ExchangeContext {
        config: config.clone(),
        peer: session.peer,
        route: Route::Forward,
        upstreams: UpstreamPool::new(),
        shutdown: shutdown.clone(),
    });
    let slot = TunnelSlot::default();
    let service_slot = slot.clone();

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(
            TokioIo::new(stream),
            service_fn(move |mut req: Request<Incoming>| {
                let ctx = ctx.clone();
                let slot = service_slot.clone();
                async move {
                    if req.method() == Method::CONNECT {
                        debug!("CONNECT {} from {}", req.uri(), ctx.peer);
                        return Ok::<_, Infallible>(accept_connect(&mut req, &slot));
                    }
                    exchange::handle(req, ctx).await
                }
            }),
        )
        .with_upgrades();
    tokio::pin!(conn);

    let finished = tokio::select! {
        result = conn.as_mut() => Some(result),
        _ = shutdown_requested(&mut shutdown) => None,
    };
    let served = match finished {
        Some(result) => result,
        None => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    served.map_err(|e| anyhow!("HTTP service error: {}", e))?;

    let pending = slot.lock().take();
    let Some(pending) = pending else {
        return Ok(());
    };

    session.transition(SessionState::ConnectEstablished);
    let upgraded = pending.upgrade.await.context("CONNECT upgrade failed")?;
    let target = TunnelTarget {
        host: pending.host,
        port: pending.port,
        connect_addr: None,
        transparent: false,
    };
    intercept(TokioIo::new(upgraded), target, session, config, shutdown).await
}

/// Handle the client side of an established tunnel
///
/// With inspection on, a TLS ClientHello is terminated with a leaf for the SNI
/// (falling back to the tunnel host) and plain HTTP is served directly. With
/// inspection off, or TLS without a CA, bytes are relayed untouched.
pub(crate) async fn intercept<I>(
    io: I,
    target: TunnelTarget,
    session: &mut Session,
    config: Arc<ProxyConfig>,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if !config.inspect_enabled {
        return relay_opaque(io, &target, session, &config, shutdown).await;
    }

    let (first, io) = Rewind::sniff(io).await.context("failed to read from client")?;
    let Some(first) = first else {
        return Ok(());
    };

    if first != TLS_HANDSHAKE {
        session.transition(SessionState::Relaying);
        let route = Route::Fixed {
            scheme: Scheme::Http,
            host: target.host,
            port: target.port,
            connect_addr: target.connect_addr,
            host_from_header: target.transparent,
        };
        return serve_tunnel(io, route, session, config, shutdown).await;
    }

    let Some(ca) = config.ca.clone() else {
        debug!("No CA loaded, relaying TLS to {}:{} without inspection", target.host, target.port);
        return relay_opaque(io, &target, session, &config, shutdown).await;
    };

    session.transition(SessionState::TlsHandshaking);
    let acceptor = tls::acceptor(ca, Some(target.host.clone()))?;
    let tls_stream = timeout(CLIENT_TLS_TIMEOUT, acceptor.accept(io))
        .await
        .map_err(|_| anyhow!("client TLS handshake timed out"))?
        .context("client TLS handshake failed")?;

    let sni = tls_stream.get_ref().1.server_name().map(str::to_ascii_lowercase);
    let host = match sni {
        Some(sni) if target.transparent => sni,
        _ => target.host,
    };
    trace!("Session {} decrypted tunnel to {}:{}", session.id, host, target.port);

    session.transition(SessionState::Relaying);
    let route = Route::Fixed {
        scheme: Scheme::Https,
        host,
        port: target.port,
        connect_addr: target.connect_addr,
        host_from_header: target.transparent,
    };
    serve_tunnel(tls_stream, route, session, config, shutdown).await
}

async fn serve_tunnel<I>(
    io: I,
    route: Route,
    session: &Session,
    config: Arc<ProxyConfig>,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let ctx = Arc::new(ExchangeContext {
        config,
        peer: session.peer,
        route,
        upstreams: UpstreamPool::new(),
        shutdown,
    });
    exchange::serve(io, ctx).await
}

async fn relay_opaque<I>(
    io: I,
    target: &TunnelTarget,
    session: &mut Session,
    config: &ProxyConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin,
{
    session.transition(SessionState::Relaying);

    let plan = config.throttle.plan_for_host(&target.host);
    delay_before_forward(&plan).await;

    let origin = UpstreamTarget {
        scheme: Scheme::Http,
        host: target.host.clone(),
        port: target.port,
        connect_addr: target.connect_addr,
    };
    let mut upstream = upstream::connect_raw(&origin).await?;
    let mut client = ShapedStream::new(io, plan.upstream_bps, plan.downstream_bps);

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
            let (up, down) = result.context("tunnel relay failed")?;
            debug!(
                "Tunnel {}:{} closed ({} bytes up, {} bytes down)",
                target.host, target.port, up, down
            );
        }
        _ = shutdown_requested(&mut shutdown) => {
            debug!("Closing tunnel {}:{} for shutdown", target.host, target.port);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transitions() {
        let mut session = Session::new("127.0.0.1:5000".parse().unwrap());
        assert_eq!(session.state(), SessionState::Accepted);
        session.transition(SessionState::ConnectEstablished);
        session.transition(SessionState::TlsHandshaking);
        assert_eq!(session.state(), SessionState::TlsHandshaking);

        let other = Session::new("127.0.0.1:5001".parse().unwrap());
        assert!(other.id > session.id);
    }

    #[test]
    fn test_finish_reports_state_at_failure() {
        use tracing::field::Field;
        use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};

        struct Capture(Arc<Mutex<Vec<String>>>);

        impl<S: tracing::Subscriber> Layer<S> for Capture {
            fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
                let mut message = String::new();
                event.record(&mut |field: &Field, value: &dyn fmt::Debug| {
                    if field.name() == "message" {
                        message = format!("{:?}", value);
                    }
                });
                self.0.lock().push(message);
            }
        }

        let captured = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(Capture(captured.clone()));
        tracing::subscriber::with_default(subscriber, || {
            let mut session = Session::new("127.0.0.1:5002".parse().unwrap());
            session.transition(SessionState::TlsHandshaking);
            session.finish(Err(anyhow!("handshake eof")));
        });

        let logs = captured.lock();
        assert!(
            logs.iter()
                .any(|line| line.contains("failed while TlsHandshaking") && line.contains("handshake eof")),
            "{:?}",
            logs
        );
    }

    #[tokio::test]
    async fn test_shutdown_requested_resolves() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        timeout(Duration::from_secs(1), shutdown_requested(&mut rx)).await.unwrap();
    }
}
