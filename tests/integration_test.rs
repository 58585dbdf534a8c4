//! Integration tests for crab-mitm
//!
//! Runs the engine against local hyper backends:
//! - Absolute-form proxying with status rewrite
//! - CONNECT + TLS interception with map-local
//! - Opaque tunnels when inspection is off
//! - Client allowlist
//! - Snapshot isolation for live sessions
//! - Transparent listener with an injected resolver
//! - Bandwidth shaping
//! - CA round-trip for every key algorithm

use bytes::Bytes;
use crab_mitm::{
    generate_ca_files, set_log_sink, tls, CaMaterial, KeyAlgorithm, LogLevel, ProxyHandle, StaticDestination,
};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Backend answering `backend|path=<path>|host=<host>`
async fn run_backend_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("unknown")
                        .to_string();
                    let text = format!("backend|path={}|host={}", req.uri().path(), host);
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(text))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

async fn start_proxy(handle: &ProxyHandle) -> SocketAddr {
    handle.start().await.unwrap();
    handle.local_addrs()[0]
}

fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy)).unwrap())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Read until `needle` shows up, the peer closes, or five seconds pass
async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, needle: &str) -> String {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while !String::from_utf8_lossy(&collected).contains(needle) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => collected.extend_from_slice(&buf[..n]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

async fn connect_tunnel(proxy: SocketAddr, authority: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_until(&mut stream, "\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT reply: {}", head);
    stream
}

async fn get_over<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, path: &str, host: &str, needle: &str) -> String {
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, host);
    stream.write_all(request.as_bytes()).await.unwrap();
    read_until(stream, needle).await
}

fn trusting(ca: &CaMaterial) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(ca.cert_der().clone()).unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn test_status_rewrite_through_proxy() {
    let backend = run_backend_server().await;
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    handle
        .rules_add_status_rewrite("127.0.0.1/api/*", Some(200), 404)
        .unwrap();
    let proxy = start_proxy(&handle).await;
    let client = proxied_client(proxy);

    let response = client
        .get(format!("http://{}/api/users", backend))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    assert!(response.text().await.unwrap().starts_with("backend|path=/api/users"));

    let response = client
        .get(format!("http://{}/other", backend))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_origin_form_request_rejected() {
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    let proxy = start_proxy(&handle).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let reply = get_over(&mut stream, "/", "example.com", "\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 400"), "{}", reply);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_upstream_is_502() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = closed.local_addr().unwrap();
    drop(closed);

    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    let proxy = start_proxy(&handle).await;
    let response = proxied_client(proxy)
        .get(format!("http://{}/", dead))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_tls_interception_with_map_local() {
    let dir = tempdir().unwrap();
    let cert_path = dir.path().join("ca.pem");
    let key_path = dir.path().join("ca.key");
    generate_ca_files("Crab Test CA", 30, &cert_path, &key_path, KeyAlgorithm::EcdsaP256).unwrap();
    let ca = CaMaterial::load(&cert_path, &key_path).unwrap();

    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    handle.load_ca(&cert_path, &key_path).unwrap();
    handle
        .rules_add_map_local_text("*.test.local", "hi", 200, None)
        .unwrap();
    let proxy = start_proxy(&handle).await;

    let tunnel = connect_tunnel(proxy, "api.test.local:443").await;
    let name = ServerName::try_from("api.test.local").unwrap();
    let mut tls = trusting(&ca).connect(name, tunnel).await.unwrap();

    let reply = get_over(&mut tls, "/hello", "api.test.local", "\r\n\r\nhi").await;
    assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);
    assert!(reply.contains("text/plain"), "{}", reply);
    assert!(reply.ends_with("\r\n\r\nhi"), "{}", reply);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_plain_http_inside_tunnel() {
    let backend = run_backend_server().await;
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    handle
        .rules_add_status_rewrite("127.0.0.1", None, 203)
        .unwrap();
    let proxy = start_proxy(&handle).await;

    let mut tunnel = connect_tunnel(proxy, &backend.to_string()).await;
    let reply = get_over(&mut tunnel, "/inner", &backend.to_string(), "path=/inner").await;
    assert!(reply.starts_with("HTTP/1.1 203"), "{}", reply);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_opaque_tunnel_when_inspection_disabled() {
    let backend = run_backend_server().await;
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    handle.set_inspect_enabled(false).unwrap();
    handle.rules_add_map_local_text("*", "mocked", 200, None).unwrap();
    let proxy = start_proxy(&handle).await;

    let mut tunnel = connect_tunnel(proxy, &backend.to_string()).await;
    let reply = get_over(&mut tunnel, "/raw", "opaque.example", "host=opaque.example").await;
    assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);
    assert!(reply.contains("backend|path=/raw|host=opaque.example"), "{}", reply);
    assert!(!reply.contains("mocked"));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_allowlist() {
    let backend = run_backend_server().await;
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    handle.set_client_allowlist_enabled(true).unwrap();
    handle.client_allowlist_add_ip("10.0.0.1").unwrap();
    let proxy = start_proxy(&handle).await;

    let mut rejected = TcpStream::connect(proxy).await.unwrap();
    let url = format!("http://{}/", backend);
    let _ = rejected
        .write_all(format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", url, backend).as_bytes())
        .await;
    let mut buf = [0u8; 64];
    match timeout(Duration::from_secs(5), rejected.read(&mut buf)).await.unwrap() {
        Ok(n) => assert_eq!(n, 0, "rejected client got a response"),
        Err(_) => {}
    }

    // Allowlist changes apply to the next connection.
    handle.client_allowlist_add_ip("127.0.0.1").unwrap();
    let response = proxied_client(proxy).get(url).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_live_sessions_keep_their_snapshot() {
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    handle.rules_add_map_local_text("mock.local", "first", 200, None).unwrap();
    let proxy = start_proxy(&handle).await;

    let mut early = TcpStream::connect(proxy).await.unwrap();
    let reply = get_over(&mut early, "http://mock.local/", "mock.local", "first").await;
    assert!(reply.ends_with("first"), "{}", reply);

    handle.rules_clear().unwrap();
    handle.rules_add_map_local_text("mock.local", "second", 200, None).unwrap();

    let reply = get_over(&mut early, "http://mock.local/", "mock.local", "first").await;
    assert!(reply.ends_with("first"), "{}", reply);

    let mut late = TcpStream::connect(proxy).await.unwrap();
    let reply = get_over(&mut late, "http://mock.local/", "mock.local", "second").await;
    assert!(reply.ends_with("second"), "{}", reply);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_transparent_listener_with_static_destination() {
    let backend = run_backend_server().await;
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    handle.set_transparent_enabled(true).unwrap();
    handle.set_transparent_port(0).unwrap();
    handle
        .set_destination_resolver(Arc::new(StaticDestination(backend)))
        .unwrap();
    handle.rules_add_status_rewrite("redirected.example", Some(200), 201).unwrap();
    handle.start().await.unwrap();

    let addrs = handle.local_addrs();
    assert_eq!(addrs.len(), 2);

    let mut stream = TcpStream::connect(addrs[1]).await.unwrap();
    let reply = get_over(&mut stream, "/t", "redirected.example", "host=redirected.example").await;
    assert!(reply.starts_with("HTTP/1.1 201"), "{}", reply);
    assert!(reply.contains("backend|path=/t"), "{}", reply);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_transparent_loop_is_dropped() {
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    handle.set_transparent_enabled(true).unwrap();
    handle.set_transparent_port(0).unwrap();
    handle.start().await.unwrap();

    let transparent = handle.local_addrs()[1];
    handle
        .set_destination_resolver(Arc::new(StaticDestination(transparent)))
        .unwrap();

    let mut stream = TcpStream::connect(transparent).await.unwrap();
    let reply = read_until(&mut stream, "HTTP/1.1").await;
    assert!(reply.is_empty(), "{}", reply);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_downstream_bandwidth_cap() {
    let payload = "x".repeat(20_000);
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    handle.rules_add_map_local_text("slow.local", payload.clone(), 200, None).unwrap();
    handle.set_throttle_enabled(true).unwrap();
    handle.set_throttle_downstream_bps(10_000).unwrap();
    let proxy = start_proxy(&handle).await;

    let started = Instant::now();
    let body = proxied_client(proxy)
        .get("http://slow.local/big")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body.len(), payload.len());
    // 20,000 bytes at 10,000 bytes per second, less timer resolution.
    assert!(started.elapsed() >= Duration::from_millis(1995), "{:?}", started.elapsed());

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_ca_round_trip_for_every_algorithm() {
    for algorithm in [KeyAlgorithm::EcdsaP256, KeyAlgorithm::Rsa2048, KeyAlgorithm::Rsa4096] {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca.key");
        generate_ca_files("Round Trip CA", 7, &cert_path, &key_path, algorithm).unwrap();

        let ca = Arc::new(CaMaterial::load(&cert_path, &key_path).unwrap());
        assert_eq!(ca.algorithm(), algorithm);

        let acceptor = tls::acceptor(ca.clone(), None).unwrap();
        let connector = trusting(&ca);
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let name = ServerName::try_from("roundtrip.example").unwrap();

        let (server, client) = tokio::join!(acceptor.accept(server_io), connector.connect(name, client_io));
        assert!(server.is_ok(), "{:?}: {:?}", algorithm, server.err());
        assert!(client.is_ok(), "{:?}: {:?}", algorithm, client.err());
    }
}

#[tokio::test]
async fn test_stop_closes_listener() {
    let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
    let proxy = start_proxy(&handle).await;
    handle.stop().await.unwrap();
    assert!(!handle.is_running());
    assert!(TcpStream::connect(proxy).await.is_err());
    handle.destroy().await.unwrap();
}

#[test]
fn test_log_sink_receives_engine_errors_without_init() {
    let captured: Arc<Mutex<Vec<(LogLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_store = captured.clone();
    set_log_sink(Some(Arc::new(move |level, message: &str| {
        sink_store.lock().unwrap().push((level, message.to_string()));
    })));

    let err = CaMaterial::from_pem("not a certificate", "not a key").unwrap_err();
    set_log_sink(None);

    let logs = captured.lock().unwrap();
    assert!(
        logs.iter()
            .any(|(level, message)| *level == LogLevel::Error && message == &err.to_string()),
        "{:?}",
        logs
    );
}
