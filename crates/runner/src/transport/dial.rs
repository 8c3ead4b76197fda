use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::Uri;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::error::RunnerError;
use crate::transport::proxy::{ProxyPolicy, ProxyTarget};

/// Upper bound on a proxy's CONNECT reply head
const MAX_TUNNEL_HEAD: usize = 8 * 1024;

type HostTable = Arc<Mutex<HashMap<String, Arc<Semaphore>>>>;

/// One slot of a host's connection budget.
///
/// Dropping the last lease of a host removes the host from the table.
struct HostLease {
    key: String,
    hosts: HostTable,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for HostLease {
    fn drop(&mut self) {
        drop(self.permit.take());
        let mut hosts = self.hosts.lock();
        // the table holds the only reference once no permit or waiter is left
        if hosts
            .get(&self.key)
            .is_some_and(|budget| Arc::strong_count(budget) == 1)
        {
            hosts.remove(&self.key);
        }
    }
}

/// TCP stream holding one slot of its host's connection budget
pub struct DialedStream {
    io: TcpStream,
    /// Plain-HTTP request routed through a proxy (absolute-form targets)
    proxied: bool,
    _lease: HostLease,
}

impl Connection for DialedStream {
    fn connected(&self) -> Connected {
        self.io.connected().proxy(self.proxied)
    }
}

impl AsyncRead for DialedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for DialedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Opens TCP connections to targets or their proxies.
///
/// Connections to one host are capped; a dial beyond the cap waits until an
/// existing connection to that host is closed.
#[derive(Clone)]
pub struct DialConnector {
    proxy: Arc<ProxyPolicy>,
    timeout: Duration,
    max_conns_per_host: usize,
    hosts: HostTable,
}

impl DialConnector {
    pub fn new(proxy: ProxyPolicy, timeout: Duration, max_conns_per_host: usize) -> Self {
        Self {
            proxy: Arc::new(proxy),
            timeout,
            max_conns_per_host: max_conns_per_host.max(1),
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for a free slot in the budget of `key`
    async fn lease(&self, key: &str) -> Result<HostLease, RunnerError> {
        let mut lease = HostLease {
            key: key.to_string(),
            hosts: self.hosts.clone(),
            permit: None,
        };
        let budget = self
            .hosts
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_conns_per_host)))
            .clone();
        let permit = budget
            .acquire_owned()
            .await
            .map_err(|_| RunnerError::Proxy("connection budget closed".to_string()))?;
        lease.permit = Some(permit);
        Ok(lease)
    }

    /// Hosts currently holding or waiting for a connection slot
    pub fn tracked_hosts(&self) -> usize {
        self.hosts.lock().len()
    }

    async fn connect(self, dst: Uri) -> Result<DialedStream, RunnerError> {
        let scheme = dst.scheme_str().unwrap_or("http").to_string();
        let host = dst
            .host()
            .ok_or_else(|| RunnerError::RequestBuild(format!("missing host in {}", dst)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = dst
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let authority = format!("{}:{}", dst.host().unwrap_or_default(), port);

        let lease = self.lease(&authority).await?;

        match self.proxy.intercept(&dst).cloned() {
            None => {
                let io = self.dial(&host, port).await?;
                Ok(DialedStream {
                    io,
                    proxied: false,
                    _lease: lease,
                })
            }
            Some(proxy) => {
                if proxy.url.scheme() != "http" {
                    return Err(RunnerError::Proxy(format!(
                        "unsupported proxy scheme {:?}",
                        proxy.url.scheme()
                    )));
                }
                let (proxy_host, proxy_port) = proxy.address();
                let mut io = self.dial(&proxy_host, proxy_port).await?;

                if scheme == "https" {
                    log::trace!("Opening CONNECT tunnel to {} via {}", authority, proxy.url);
                    timeout(self.timeout, tunnel(&mut io, &authority, &proxy))
                        .await
                        .map_err(|_| RunnerError::Timeout(self.timeout))??;
                    Ok(DialedStream {
                        io,
                        proxied: false,
                        _lease: lease,
                    })
                } else {
                    Ok(DialedStream {
                        io,
                        proxied: true,
                        _lease: lease,
                    })
                }
            }
        }
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, RunnerError> {
        let stream = timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RunnerError::Timeout(self.timeout))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Service<Uri> for DialConnector {
    type Response = DialedStream;
    type Error = RunnerError;
    type Future = Pin<Box<dyn Future<Output = Result<DialedStream, RunnerError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        Box::pin(self.clone().connect(dst))
    }
}

/// Ask an HTTP proxy for a tunnel to `authority` and wait for a 2xx reply
async fn tunnel(io: &mut TcpStream, authority: &str, proxy: &ProxyTarget) -> Result<(), RunnerError> {
    let mut head = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
    if let Some(auth) = &proxy.authorization {
        head.push_str("Proxy-Authorization: ");
        head.push_str(auth);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    io.write_all(head.as_bytes()).await?;

    let mut reply = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    // byte-at-a-time so nothing past the reply head is consumed
    while !reply.ends_with(b"\r\n\r\n") {
        if reply.len() >= MAX_TUNNEL_HEAD {
            return Err(RunnerError::Proxy("CONNECT reply head too large".to_string()));
        }
        if io.read(&mut byte).await? == 0 {
            return Err(RunnerError::Proxy(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        reply.push(byte[0]);
    }

    let status = parse_status_line(&reply)
        .ok_or_else(|| RunnerError::Proxy("malformed CONNECT reply".to_string()))?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(RunnerError::Proxy(format!(
            "proxy refused CONNECT to {} with status {}",
            authority, status
        )))
    }
}

fn parse_status_line(head: &[u8]) -> Option<u16> {
    let line_end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
