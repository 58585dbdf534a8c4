//! Traffic shaping: fixed latency per exchange and per-direction bandwidth caps
//!
//! Downstream means upstream-to-client, upstream means client-to-upstream.
//! A cap of zero is unlimited. Every chunk is charged against the cap before
//! it is released, so chunk `k` leaves at `k * chunk / B` and `N` bytes at `B`
//! bytes per second never arrive in less than `N / B` seconds.

use crate::matcher::Matcher;
use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

/// Largest chunk released at once by a pacer
const MAX_CHUNK: usize = 64 * 1024;

/// Throttle settings carried in the configuration snapshot
#[derive(Debug, Clone, Default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub latency_ms: u64,
    pub downstream_bps: u64,
    pub upstream_bps: u64,
    pub only_selected_hosts: bool,
    pub selected_hosts: Vec<Matcher>,
}

impl ThrottleConfig {
    /// Shaping for one HTTP exchange; `host` may carry a port
    pub fn plan(&self, host: &str, path: &str) -> ShapingPlan {
        self.plan_if(|matcher| matcher.matches(host, path))
    }

    pub fn plan_target(&self, host: &str, port: Option<u16>, path: &str) -> ShapingPlan {
        self.plan_if(|matcher| matcher.matches_target(host, port, path))
    }

    /// Shaping for an opaque tunnel where only the host is known
    pub fn plan_for_host(&self, host: &str) -> ShapingPlan {
        self.plan_if(|matcher| matcher.matches_host(host))
    }

    fn plan_if(&self, in_scope: impl Fn(&Matcher) -> bool) -> ShapingPlan {
        if !self.enabled {
            return ShapingPlan::UNSHAPED;
        }
        if self.only_selected_hosts && !self.selected_hosts.iter().any(in_scope) {
            return ShapingPlan::UNSHAPED;
        }
        ShapingPlan {
            latency: Duration::from_millis(self.latency_ms),
            downstream_bps: self.downstream_bps,
            upstream_bps: self.upstream_bps,
        }
    }
}

/// Shaping applied to one exchange or tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShapingPlan {
    pub latency: Duration,
    pub downstream_bps: u64,
    pub upstream_bps: u64,
}

impl ShapingPlan {
    pub const UNSHAPED: ShapingPlan = ShapingPlan {
        latency: Duration::ZERO,
        downstream_bps: 0,
        upstream_bps: 0,
    };

    pub fn is_active(&self) -> bool {
        !self.latency.is_zero() || self.downstream_bps > 0 || self.upstream_bps > 0
    }
}

/// Sleep once for the configured latency
pub async fn delay_before_forward(plan: &ShapingPlan) {
    if !plan.latency.is_zero() {
        tokio::time::sleep(plan.latency).await;
    }
}

/// Token clock for one direction of traffic
#[derive(Debug)]
pub struct Pacer {
    bps: u64,
    next_ready: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Pacer {
    pub fn new(bps: u64) -> Self {
        Self {
            bps,
            next_ready: None,
            sleep: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bps == 0
    }

    /// Bytes released per step, roughly a tenth of a second of traffic
    pub fn chunk_limit(&self) -> usize {
        if self.bps == 0 {
            return MAX_CHUNK;
        }
        usize::try_from(self.bps / 10).unwrap_or(MAX_CHUNK).clamp(1, MAX_CHUNK)
    }

    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(sleep) = self.sleep.as_mut() {
            ready!(sleep.as_mut().poll(cx));
            self.sleep = None;
        }
        Poll::Ready(())
    }

    pub async fn ready(&mut self) {
        poll_fn(|cx| self.poll_ready(cx)).await
    }

    /// Charge `bytes` against the cap; release them once `ready` resolves
    pub fn record(&mut self, bytes: usize) {
        if self.bps == 0 || bytes == 0 {
            return;
        }
        let now = Instant::now();
        let start = match self.next_ready {
            Some(next) if next > now => next,
            _ => now,
        };
        let next = start + Duration::from_secs_f64(bytes as f64 / self.bps as f64);
        self.next_ready = Some(next);
        self.sleep = Some(Box::pin(sleep_until(next)));
    }
}

pin_project! {
    /// Stream paced in both directions
    ///
    /// `read_bps` caps bytes read from the inner stream and `write_bps` caps
    /// bytes written to it.
    pub struct ShapedStream<S> {
        #[pin]
        inner: S,
        read_pacer: Pacer,
        write_pacer: Pacer,
        // Bytes read and charged, waiting for the read pacer
        read_held: Bytes,
        // Bytes already charged for the next write
        write_reserved: usize,
    }
}

impl<S> ShapedStream<S> {
    pub fn new(inner: S, read_bps: u64, write_bps: u64) -> Self {
        Self {
            inner,
            read_pacer: Pacer::new(read_bps),
            write_pacer: Pacer::new(write_bps),
            read_held: Bytes::new(),
            write_reserved: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead> AsyncRead for ShapedStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        if this.read_pacer.is_unlimited() || buf.remaining() == 0 {
            return this.inner.poll_read(cx, buf);
        }

        if this.read_held.is_empty() {
            let mut scratch = vec![0u8; this.read_pacer.chunk_limit().min(buf.remaining())];
            let mut limited = ReadBuf::new(&mut scratch);
            ready!(this.inner.as_mut().poll_read(cx, &mut limited))?;
            let n = limited.filled().len();
            if n == 0 {
                return Poll::Ready(Ok(()));
            }
            scratch.truncate(n);
            this.read_pacer.record(n);
            *this.read_held = Bytes::from(scratch);
        }

        ready!(this.read_pacer.poll_ready(cx));
        let n = this.read_held.len().min(buf.remaining());
        buf.put_slice(&this.read_held.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for ShapedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        if this.write_pacer.is_unlimited() || buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }

        if *this.write_reserved == 0 {
            let n = this.write_pacer.chunk_limit().min(buf.len());
            this.write_pacer.record(n);
            *this.write_reserved = n;
        }

        ready!(this.write_pacer.poll_ready(cx));
        let limit = (*this.write_reserved).min(buf.len());
        let n = ready!(this.inner.poll_write(cx, &buf[..limit]))?;
        *this.write_reserved = 0;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        ready!(this.write_pacer.poll_ready(cx));
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        ready!(this.write_pacer.poll_ready(cx));
        this.inner.poll_shutdown(cx)
    }
}

pin_project! {
    /// HTTP body whose data frames are released at a capped rate
    pub struct ShapedBody<B> {
        #[pin]
        inner: B,
        pacer: Pacer,
        // Charged chunk waiting for the pacer
        held: Option<Bytes>,
        pending: Option<Bytes>,
    }
}

impl<B> ShapedBody<B> {
    pub fn new(inner: B, bps: u64) -> Self {
        Self {
            inner,
            pacer: Pacer::new(bps),
            held: None,
            pending: None,
        }
    }
}

impl<B> Body for ShapedBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let this = self.project();
        if this.pacer.is_unlimited() {
            return this.inner.poll_frame(cx);
        }

        if this.held.is_none() {
            let mut data = match this.pending.take() {
                Some(data) => data,
                None => match ready!(this.inner.poll_frame(cx)) {
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) => data,
                        Err(frame) => return Poll::Ready(Some(Ok(frame))),
                    },
                    other => return Poll::Ready(other),
                },
            };

            let n = this.pacer.chunk_limit().min(data.len());
            let chunk = data.split_to(n);
            if !data.is_empty() {
                *this.pending = Some(data);
            }
            this.pacer.record(chunk.len());
            *this.held = Some(chunk);
        }

        ready!(this.pacer.poll_ready(cx));
        match this.held.take() {
            Some(chunk) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.held.is_none() && self.pending.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let pending = [&self.held, &self.pending]
            .into_iter()
            .map(|b| b.as_ref().map(|b| b.len() as u64).unwrap_or(0))
            .sum::<u64>();
        let inner = self.inner.size_hint();
        match inner.exact() {
            Some(exact) => SizeHint::with_exact(exact + pending),
            None => {
                let mut hint = SizeHint::new();
                hint.set_lower(inner.lower() + pending);
                if let Some(upper) = inner.upper() {
                    hint.set_upper(upper + pending);
                }
                hint
            }
        }
    }
}

/// Copy until EOF, pacing at `bps`; zero copies without a cap
pub async fn throttled_copy<R, W>(reader: &mut R, writer: &mut W, bps: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if bps == 0 {
        return tokio::io::copy(reader, writer).await;
    }

    let mut pacer = Pacer::new(bps);
    let mut buf = vec![0u8; pacer.chunk_limit()];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        pacer.record(n);
        pacer.ready().await;
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    writer.flush().await?;
    Ok(total)
}
