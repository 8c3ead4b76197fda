//! Time-to-first-byte measurement.
//!
//! The traced stream sits above TLS, so it only observes request bytes going
//! out and response bytes coming in. An HTTP/1.1 connection carries one
//! exchange at a time, which makes the timing state of a connection belong to
//! whichever request currently owns it.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::Uri;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Default)]
struct TimingState {
    /// When the most recent request bytes were written
    wrote_at: Option<Instant>,
    /// Delay between the last write and the first read that followed it
    first_byte: Option<Duration>,
    /// A response is being read; the next write starts a new exchange
    reading: bool,
}

/// Handle on the timing of the exchange currently running on a connection.
///
/// Handed to hyper as connection metadata, it shows up in the extensions of
/// every response received on that connection.
#[derive(Debug, Clone, Default)]
pub struct ExchangeTiming {
    state: Arc<Mutex<TimingState>>,
}

impl ExchangeTiming {
    fn mark_written(&self) {
        let mut state = self.state.lock();
        if state.reading {
            state.reading = false;
            state.first_byte = None;
        }
        state.wrote_at = Some(Instant::now());
    }

    fn mark_read(&self) {
        let mut state = self.state.lock();
        if state.reading {
            return;
        }
        state.reading = true;
        if let Some(wrote_at) = state.wrote_at {
            state.first_byte = Some(wrote_at.elapsed());
        }
    }

    /// Time from the end of the request write to the first response byte
    pub fn first_byte(&self) -> Option<Duration> {
        self.state.lock().first_byte
    }
}

/// Stream wrapper feeding an `ExchangeTiming`
pub struct TracedStream<S> {
    inner: S,
    timing: ExchangeTiming,
}

impl<S> TracedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            timing: ExchangeTiming::default(),
        }
    }

    pub fn timing(&self) -> &ExchangeTiming {
        &self.timing
    }
}

impl<S: Connection> Connection for TracedStream<S> {
    fn connected(&self) -> Connected {
        self.inner.connected().extra(self.timing.clone())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TracedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            if buf.filled().len() > before {
                self.timing.mark_read();
            }
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TracedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = polled {
            if n > 0 {
                self.timing.mark_written();
            }
        }
        polled
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = polled {
            if n > 0 {
                self.timing.mark_written();
            }
        }
        polled
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Outermost connector layer: bounds dial plus TLS handshake by the timeout
/// and wraps the resulting plaintext stream for timing.
#[derive(Clone)]
pub struct TracedConnector<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TracedConnector<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> Service<Uri> for TracedConnector<C>
where
    C: Service<Uri>,
    C::Response: AsyncRead + AsyncWrite + Connection + Unpin + Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = TracedStream<C::Response>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let limit = self.timeout;
        let connecting = self.inner.call(dst);
        Box::pin(async move {
            match tokio::time::timeout(limit, connecting).await {
                Ok(Ok(stream)) => Ok(TracedStream::new(stream)),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(Box::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", limit),
                )) as BoxError),
            }
        })
    }
}
