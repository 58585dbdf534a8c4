//! HTTP exchange pipeline
//!
//! Every request seen by the proxy, whether absolute-form on the main listener,
//! decrypted inside a tunnel, or plain inside a tunnel, is served here: rule
//! decision, latency, local answer or upstream forward, status rewrite, shaped
//! bodies and `101` upgrade piping. Each exchange ends with one `CRAB_JSON`
//! log entry.

use crate::config::ProxyConfig;
use crate::matcher::split_authority;
use crate::proxy::shutdown_requested;
use crate::rules::{local_content_type, remap_url, rewritten_status, Decision, LocalBody, TEXT_CONTENT_TYPE};
use crate::throttle::{delay_before_forward, ShapedBody, ShapedStream, ShapingPlan};
use crate::upstream::{ProxyBody, Scheme, UpstreamPool, UpstreamTarget};
use anyhow::{anyhow, Context as _};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn, Level};
use uuid::Uuid;

/// How requests of a connection find their origin
#[derive(Debug, Clone)]
pub(crate) enum Route {
    /// Main listener, requests carry an absolute URI
    Forward,
    /// Tunnel or transparent connection with a known origin
    Fixed {
        scheme: Scheme,
        host: String,
        port: u16,
        connect_addr: Option<SocketAddr>,
        /// Prefer the Host header over `host` when naming the origin
        host_from_header: bool,
    },
}

/// State shared by the exchanges of one connection
#[derive(Debug)]
pub(crate) struct ExchangeContext {
    pub config: Arc<ProxyConfig>,
    pub peer: SocketAddr,
    pub route: Route,
    pub upstreams: UpstreamPool,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestTarget {
    upstream: UpstreamTarget,
    path_and_query: String,
}

impl RequestTarget {
    fn url(&self) -> String {
        format!(
            "{}://{}{}",
            self.upstream.scheme.as_str(),
            self.upstream.authority(),
            self.path_and_query
        )
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn resolve_target<B>(req: &Request<B>, route: &Route) -> Result<RequestTarget, &'static str> {
    let uri = req.uri();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| pq.starts_with('/'))
        .unwrap_or("/")
        .to_string();

    let upstream = match route {
        Route::Forward => {
            let scheme = match uri.scheme_str() {
                Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
                Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
                Some(_) => return Err("Unsupported URI scheme"),
                None => return Err("Proxy requests must use an absolute URI"),
            };
            let host = uri.host().filter(|h| !h.is_empty()).ok_or("Missing host in request URI")?;
            UpstreamTarget {
                scheme,
                host: strip_brackets(host).to_ascii_lowercase(),
                port: uri.port_u16().unwrap_or(scheme.default_port()),
                connect_addr: None,
            }
        }
        Route::Fixed {
            scheme,
            host,
            port,
            connect_addr,
            host_from_header,
        } => {
            let header_host = req
                .headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(|h| split_authority(h.trim()).0)
                .filter(|h| !h.is_empty());
            let host = match header_host {
                Some(h) if *host_from_header => strip_brackets(h).to_ascii_lowercase(),
                _ => host.clone(),
            };
            UpstreamTarget {
                scheme: *scheme,
                host,
                port: *port,
                connect_addr: *connect_addr,
            }
        }
    };

    Ok(RequestTarget {
        upstream,
        path_and_query,
    })
}

fn target_from_url(url: &url::Url) -> anyhow::Result<RequestTarget> {
    let scheme = match url.scheme() {
        "https" => Scheme::Https,
        "http" => Scheme::Http,
        other => return Err(anyhow!("unsupported map-remote scheme {}", other)),
    };
    let host = url.host_str().ok_or_else(|| anyhow!("map-remote URL has no host"))?;
    Ok(RequestTarget {
        upstream: UpstreamTarget {
            scheme,
            host: strip_brackets(host).to_string(),
            port: url.port_or_known_default().unwrap_or(scheme.default_port()),
            connect_addr: None,
        },
        path_and_query: url[url::Position::BeforePath..url::Position::AfterQuery].to_string(),
    })
}

pub(crate) fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_CONTENT_TYPE));
    response
}

fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE) && has_connection_token(headers, "upgrade")
}

/// Remove hop-by-hop headers before forwarding
fn strip_hop_headers(headers: &mut HeaderMap, keep_upgrade: bool) {
    for name in ["proxy-connection", "proxy-authorization", "keep-alive"] {
        headers.remove(name);
    }
    if keep_upgrade {
        return;
    }

    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    headers.remove(CONNECTION);
    headers.remove(UPGRADE);
}

fn encode_headers(headers: &HeaderMap) -> String {
    let mut text = String::new();
    for (name, value) in headers {
        text.push_str(name.as_str());
        text.push_str(": ");
        text.push_str(&String::from_utf8_lossy(value.as_bytes()));
        text.push_str("\r\n");
    }
    BASE64.encode(text)
}

fn log_headers(event: &str, request_id: &str, peer: SocketAddr, method: &str, url: &str, headers: &HeaderMap) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }
    let meta = serde_json::json!({
        "type": "meta",
        "event": event,
        "request_id": request_id,
        "peer": peer.to_string(),
        "method": method,
        "url": url,
        "headers_b64": encode_headers(headers),
    });
    debug!("CRAB_JSON {}", meta);
}

#[derive(Serialize)]
struct ExchangeEntry<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    event: &'static str,
    request_id: &'a str,
    timestamp: String,
    peer: String,
    method: &'a str,
    url: &'a str,
    status: u16,
    duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    map_local: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule: Option<&'a str>,
}

/// Serve HTTP/1.1 exchanges over `io` until the client goes away
pub(crate) async fn serve<I>(io: I, ctx: Arc<ExchangeContext>) -> anyhow::Result<()>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut shutdown = ctx.shutdown.clone();
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(
            TokioIo::new(io),
            service_fn(move |req| {
                let ctx = ctx.clone();
                async move { handle(req, ctx).await }
            }),
        )
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => return result.map_err(|e| anyhow!("HTTP service error: {}", e)),
        _ = shutdown_requested(&mut shutdown) => {}
    }

    // Let the in-flight exchange finish, then close.
    conn.as_mut().graceful_shutdown();
    conn.await.map_err(|e| anyhow!("HTTP service error: {}", e))
}

/// Run one exchange; never fails, errors become responses
pub(crate) async fn handle(
    req: Request<Incoming>,
    ctx: Arc<ExchangeContext>,
) -> Result<Response<ProxyBody>, Infallible> {
    let started = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().to_string();

    let target = match resolve_target(&req, &ctx.route) {
        Ok(target) => target,
        Err(reason) => {
            debug!("Rejecting {} {} from {}: {}", method, req.uri(), ctx.peer, reason);
            return Ok(text_response(StatusCode::BAD_REQUEST, reason));
        }
    };
    let url = target.url();
    log_headers("request_headers", &request_id, ctx.peer, &method, &url, req.headers());

    let config = &ctx.config;
    let host = target.upstream.host.as_str();
    let port = Some(target.upstream.port);
    let decision = config.rules.evaluate(host, port, &target.path_and_query);
    let plan = config.throttle.plan_target(host, port, &target.path_and_query);
    let rule = decision.matcher().map(str::to_string);

    delay_before_forward(&plan).await;

    let mut map_local = false;
    let response = match decision {
        Decision::Respond {
            status,
            body,
            content_type,
            ..
        } => {
            map_local = true;
            local_response(status, body, content_type.as_deref(), &plan).await
        }
        Decision::Forward => forward_or_bad_gateway(req, &ctx, &target, false, &plan).await,
        Decision::RewriteStatus { from, to, .. } => {
            match forward(req, &ctx, &target, false, &plan).await {
                Ok(mut response) => {
                    let actual = response.status().as_u16();
                    let status = rewritten_status(actual, from, to);
                    if status != actual {
                        debug!("Rewriting status {} -> {} for {}", actual, status, url);
                        if let Ok(status) = StatusCode::from_u16(status) {
                            *response.status_mut() = status;
                        }
                    }
                    response
                }
                Err(e) => bad_gateway(&target, e),
            }
        }
        Decision::MapRemote { destination, .. } => {
            let remapped = remap_url(&destination, &target.path_and_query);
            match target_from_url(&remapped) {
                Ok(remote) => {
                    debug!("Mapping {} to {}", url, remapped);
                    forward_or_bad_gateway(req, &ctx, &remote, true, &plan).await
                }
                Err(e) => bad_gateway(&target, e),
            }
        }
    };

    log_headers("response_headers", &request_id, ctx.peer, &method, &url, response.headers());

    let response_size_bytes = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let entry = ExchangeEntry {
        kind: "entry",
        event: "request_complete",
        request_id: &request_id,
        timestamp: chrono::Utc::now().to_rfc3339(),
        peer: ctx.peer.to_string(),
        method: &method,
        url: &url,
        status: response.status().as_u16(),
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        response_size_bytes,
        map_local: if map_local { rule.as_deref() } else { None },
        rule: rule.as_deref(),
    };
    match serde_json::to_string(&entry) {
        Ok(json) => info!("CRAB_JSON {}", json),
        Err(e) => warn!("Failed to serialize exchange log: {}", e),
    }

    Ok(response)
}

fn bad_gateway(target: &RequestTarget, error: anyhow::Error) -> Response<ProxyBody> {
    warn!("Upstream {} failed: {:#}", target.upstream, error);
    text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
}

async fn forward_or_bad_gateway(
    req: Request<Incoming>,
    ctx: &ExchangeContext,
    target: &RequestTarget,
    rewrite_host: bool,
    plan: &ShapingPlan,
) -> Response<ProxyBody> {
    match forward(req, ctx, target, rewrite_host, plan).await {
        Ok(response) => response,
        Err(e) => bad_gateway(target, e),
    }
}

async fn forward(
    mut req: Request<Incoming>,
    ctx: &ExchangeContext,
    target: &RequestTarget,
    rewrite_host: bool,
    plan: &ShapingPlan,
) -> anyhow::Result<Response<ProxyBody>> {
    let upgrade = is_upgrade_request(req.headers());
    let client_upgrade = if upgrade { Some(hyper::upgrade::on(&mut req)) } else { None };

    let (mut parts, body) = req.into_parts();
    strip_hop_headers(&mut parts.headers, upgrade);
    parts.uri = target.path_and_query.parse().context("invalid request path")?;
    parts.version = Version::HTTP_11;
    if rewrite_host || !parts.headers.contains_key(HOST) {
        let authority = HeaderValue::from_str(&target.upstream.authority()).context("invalid upstream authority")?;
        parts.headers.insert(HOST, authority);
    }

    let body = ShapedBody::new(body, plan.upstream_bps).boxed_unsync();
    let mut response = ctx
        .upstreams
        .send(&target.upstream, Request::from_parts(parts, body))
        .await?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let server_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(pipe_upgrade(
                client_upgrade,
                server_upgrade,
                *plan,
                target.url(),
                ctx.shutdown.clone(),
            ));
        }
        let (parts, _) = response.into_parts();
        return Ok(Response::from_parts(parts, empty_body()));
    }

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(
        parts,
        ShapedBody::new(body, plan.downstream_bps).boxed_unsync(),
    ))
}

async fn pipe_upgrade(
    client: OnUpgrade,
    server: OnUpgrade,
    plan: ShapingPlan,
    url: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let (client, server) = match tokio::try_join!(client, server) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("Upgrade of {} failed: {}", url, e);
            return;
        }
    };

    let mut client = ShapedStream::new(TokioIo::new(client), plan.upstream_bps, plan.downstream_bps);
    let mut server = TokioIo::new(server);

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut server) => match result {
            Ok((up, down)) => debug!("Upgraded stream {} closed ({} bytes up, {} bytes down)", url, up, down),
            Err(e) => debug!("Upgraded stream {} ended: {}", url, e),
        },
        _ = shutdown_requested(&mut shutdown) => debug!("Closing upgraded stream {} for shutdown", url),
    }
}

async fn local_response(
    status: u16,
    body: LocalBody,
    content_type: Option<&str>,
    plan: &ShapingPlan,
) -> Response<ProxyBody> {
    let content_type = local_content_type(&body, content_type);
    let bytes = match body {
        LocalBody::Text(text) => text,
        LocalBody::File(path) => match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!("Failed to read map-local file {}: {}", path.display(), e);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read local file");
            }
        },
    };

    let length = bytes.len();
    let body = Full::new(bytes).map_err(|never: Infallible| -> hyper::Error { match never {} });
    let mut response = Response::new(ShapedBody::new(body, plan.downstream_bps).boxed_unsync());
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(length));
    response
}
