#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// A canned HTTP/1.1 server that records the raw bytes of every request
pub struct MockServer {
    pub addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockServer {
    /// Base URL of the server, e.g. `http://127.0.0.1:4242`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The next request the server received, as text
    pub async fn next_request(&mut self) -> String {
        let raw = tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("no request received in time")
            .expect("server stopped");
        String::from_utf8_lossy(&raw).to_string()
    }
}

/// Reply produced by a handler for one request
pub enum Reply {
    /// Write these bytes as the full response
    Bytes(Vec<u8>),
    /// Sleep, then write the bytes
    Delayed(Duration, Vec<u8>),
    /// Read the request and never answer
    Hang,
}

/// Start a server answering every request through `handler`
pub async fn serve<F>(handler: F) -> MockServer
where
    F: Fn(&str) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let handler = handler.clone();
            tokio::spawn(handle_connection(stream, tx, handler));
        }
    });

    MockServer { addr, requests: rx }
}

/// A server answering every request with the same response
pub async fn serve_static(response: impl AsRef<[u8]>) -> MockServer {
    let response = response.as_ref().to_vec();
    serve(move |_| Reply::Bytes(response.clone())).await
}

/// An HTTPS server with a self-signed certificate for `lancet.test`
pub struct MockTlsServer {
    pub server: MockServer,
    server_names: mpsc::UnboundedReceiver<Option<String>>,
}

impl MockTlsServer {
    /// Base URL of the server by address, e.g. `https://127.0.0.1:4242`
    pub fn url(&self) -> String {
        format!("https://{}", self.server.addr)
    }

    /// The SNI sent in the next completed handshake
    pub async fn next_server_name(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), self.server_names.recv())
            .await
            .expect("no handshake in time")
            .expect("server stopped")
    }
}

fn tls_acceptor() -> TlsAcceptor {
    let cert = Certificate(include_bytes!("../fixtures/cert.der").to_vec());
    let key = PrivateKey(include_bytes!("../fixtures/key.der").to_vec());
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .expect("fixture certificate");
    TlsAcceptor::from(Arc::new(config))
}

/// Start an HTTPS server answering every request through `handler`
pub async fn serve_tls<F>(handler: F) -> MockTlsServer
where
    F: Fn(&str) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let (names_tx, names_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(handler);
    let acceptor = tls_acceptor();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let names_tx = names_tx.clone();
            let handler = handler.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let tls = match acceptor.accept(stream).await {
                    Ok(tls) => tls,
                    Err(_) => return,
                };
                let _ = names_tx.send(tls.get_ref().1.server_name().map(str::to_string));
                handle_connection(tls, tx, handler).await;
            });
        }
    });

    MockTlsServer {
        server: MockServer { addr, requests: rx },
        server_names: names_rx,
    }
}

/// An HTTP proxy that grants every CONNECT and tunnels it to `upstream`,
/// whatever the requested authority. Records the CONNECT heads.
pub async fn serve_connect_proxy(upstream: SocketAddr) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = match read_request(&mut client).await {
                    Some(head) => head,
                    None => return,
                };
                let _ = tx.send(head);
                let mut target = match TcpStream::connect(upstream).await {
                    Ok(target) => target,
                    Err(_) => return,
                };
                if client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut client, &mut target).await;
            });
        }
    });

    MockServer { addr, requests: rx }
}

/// Accept TCP connections and never say a word
pub async fn serve_silent() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Format a complete response with a `Content-Length` body
pub fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    out.into_bytes()
}

async fn handle_connection<S, F>(mut stream: S, tx: mpsc::UnboundedSender<Vec<u8>>, handler: Arc<F>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&str) -> Reply + Send + Sync + 'static,
{
    loop {
        let raw = match read_request(&mut stream).await {
            Some(raw) => raw,
            None => return,
        };
        let text = String::from_utf8_lossy(&raw).to_string();
        let _ = tx.send(raw);

        match handler(&text) {
            Reply::Bytes(bytes) => {
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Reply::Delayed(delay, bytes) => {
                tokio::time::sleep(delay).await;
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            }
        }
    }
}

/// Read one request head plus its `Content-Length` body
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
    let body_len = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < head_end + body_len {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(buf)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
