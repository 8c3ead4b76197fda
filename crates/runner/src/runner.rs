use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hyper::body::HttpBody;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, LOCATION};
use hyper::http::uri::PathAndQuery;
use hyper::{Body, Method, Uri};
use tokio::time::{timeout_at, Instant};
use url::Url;

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::request::Request;
use crate::response::{dump_head, Response};
use crate::template::{
    derive_host_port, replace_bytes, resolve_reserved, resolve_reserved_bytes,
    substitute_headers, HostPort,
};
use crate::transport::proxy::ProxyPolicy;
use crate::transport::{self, ExchangeTiming, FuzzClient};

/// Bodies are never read past this many bytes (5 MiB)
pub const MAX_DOWNLOAD_SIZE: usize = 5_242_880;

/// Redirect hops followed before giving up, when following is enabled
pub const MAX_REDIRECTS: usize = 10;

/// Browser-shaped User-Agent sent when the template sets none
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/94.0.4606.61 Safari/537.36";

/// Version of the runner, appended to the default User-Agent
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// The User-Agent injected when a request carries none
pub fn default_user_agent() -> String {
    format!("{} v{}", DEFAULT_USER_AGENT, version())
}

/// Scheduler-facing seam over runners, so primary and replay roles can be
/// held as `Arc<dyn RunnerProvider>`
#[async_trait]
pub trait RunnerProvider: Send + Sync {
    /// Instantiate the request template with one set of fuzzing inputs
    fn prepare(&self, input: &HashMap<String, Vec<u8>>) -> Result<Request, RunnerError>;

    /// Perform one HTTP round-trip
    async fn execute(&self, request: &mut Request) -> Result<Response, RunnerError>;
}

/// Build a runner behind the scheduler-facing trait
pub fn new_runner(config: Arc<RunnerConfig>, replay: bool) -> Arc<dyn RunnerProvider> {
    Arc::new(Runner::new(config, replay))
}

/// One request on the wire; redirects produce a new hop
#[derive(Debug, Clone)]
struct Hop {
    method: Method,
    uri: Uri,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// Materializes request templates and dispatches them through one
/// long-lived, connection-pooled client.
///
/// A runner is safe to share between workers; all per-request state lives in
/// the call.
pub struct Runner {
    config: Arc<RunnerConfig>,
    client: FuzzClient,
    proxy: ProxyPolicy,
    replay: bool,
}

impl Runner {
    /// Build a runner. `replay` selects the replay proxy instead of the primary one.
    pub fn new(config: Arc<RunnerConfig>, replay: bool) -> Self {
        let proxy = ProxyPolicy::from_config(&config, replay);
        log::debug!(
            "Building {} runner: proxy={:?} timeout={:?} follow_redirects={} sni={:?}",
            if replay { "replay" } else { "primary" },
            proxy,
            config.timeout(),
            config.follow_redirects,
            config.sni
        );
        let client = transport::build_client(&config, proxy.clone());

        Self {
            config,
            client,
            proxy,
            replay,
        }
    }

    /// The configuration this runner was built from
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Whether this is the replay-role runner
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    /// Substitute the input into the request template.
    ///
    /// Never fails: a URL that does not parse leaves `{HOST}`, `{HOSTPORT}`
    /// and `{PORT}` in place. Headers are not templated for those three.
    pub fn prepare(&self, input: &HashMap<String, Vec<u8>>) -> Result<Request, RunnerError> {
        let mut req = Request::from_template(&self.config);

        for (keyword, item) in input {
            if keyword.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(item);
            req.method = req.method.replace(keyword.as_str(), &text);
            req.url = req.url.replace(keyword.as_str(), &text);
            req.opaque = req.opaque.replace(keyword.as_str(), &text);
            req.data = replace_bytes(&req.data, keyword.as_bytes(), item);
        }
        req.headers = substitute_headers(&self.config.headers, input);

        match derive_host_port(&req.url) {
            HostPort::Parsed {
                host,
                port,
                authority,
            } => {
                req.url = resolve_reserved(&req.url, &host, &authority, &port);
                req.opaque = resolve_reserved(&req.opaque, &host, &authority, &port);
                req.data = resolve_reserved_bytes(&req.data, &host, &authority, &port);
            }
            HostPort::Unresolved => {
                log::debug!("Could not parse {:?}, host placeholders left as-is", req.url);
            }
        }

        req.input = input.clone();
        Ok(req)
    }

    /// Send the request and shape the response.
    ///
    /// Records the effective host, the injected User-Agent and, with raw
    /// capture on, the raw request bytes onto `request`.
    pub async fn execute(&self, request: &mut Request) -> Result<Response, RunnerError> {
        let context = &self.config.context;
        if context.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = context.cancelled() => {
                log::debug!("Request cancelled by context");
                Err(RunnerError::Cancelled)
            }
            result = self.round_trip(request) => result,
        }
    }

    async fn round_trip(&self, request: &mut Request) -> Result<Response, RunnerError> {
        let deadline = Instant::now() + self.config.timeout();

        let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            RunnerError::RequestBuild(format!("invalid method {:?}: {}", request.method, e))
        })?;
        let url = parse_url(&request.url)?;
        let authority = url
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| RunnerError::RequestBuild(format!("no host in URL {:?}", request.url)))?;

        if !request.has_header("User-Agent") {
            request
                .headers
                .insert("User-Agent".to_string(), default_user_agent());
        }
        request.host = request
            .header("Host")
            .map(str::to_string)
            .unwrap_or_else(|| authority.clone());

        let mut hop = Hop {
            method,
            uri: request_target(&url, &request.opaque)?,
            headers: request.headers.clone(),
            body: request.data.clone(),
        };

        let mut redirects = 0;
        loop {
            let raw_request = if self.config.capture_raw() {
                Some(dump_request(&hop))
            } else {
                None
            };

            let sent = self.build_transport_request(&hop)?;
            let response = match timeout_at(deadline, self.client.request(sent)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(RunnerError::Transport(e)),
                Err(_) => return Err(RunnerError::Timeout(self.config.timeout())),
            };

            if self.config.follow_redirects {
                if let Some(next) = redirect_hop(&hop, &response, &authority) {
                    if redirects == MAX_REDIRECTS {
                        return Err(RunnerError::TooManyRedirects(MAX_REDIRECTS));
                    }
                    redirects += 1;
                    log::debug!("Following redirect {} -> {}", hop.uri, next.uri);
                    hop = next;
                    continue;
                }
            }

            return Ok(self
                .shape_response(response, request, raw_request, deadline)
                .await);
        }
    }

    fn build_transport_request(&self, hop: &Hop) -> Result<hyper::Request<Body>, RunnerError> {
        let mut builder = hyper::Request::builder()
            .method(hop.method.clone())
            .uri(hop.uri.clone());

        for (name, value) in &hop.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                RunnerError::RequestBuild(format!("invalid header name {:?}: {}", name, e))
            })?;
            let header_value = HeaderValue::from_bytes(value.as_bytes()).map_err(|e| {
                RunnerError::RequestBuild(format!("invalid value for header {}: {}", name, e))
            })?;
            builder = builder.header(header_name, header_value);
        }

        // plain-http requests carry proxy credentials themselves; https ones use the tunnel
        if hop.uri.scheme_str() == Some("http")
            && header_value(&hop.headers, "Proxy-Authorization").is_none()
        {
            if let Some(auth) = self
                .proxy
                .intercept(&hop.uri)
                .and_then(|target| target.authorization.as_deref())
            {
                builder = builder.header("Proxy-Authorization", auth);
            }
        }

        builder
            .body(Body::from(hop.body.clone()))
            .map_err(|e| RunnerError::RequestBuild(e.to_string()))
    }

    async fn shape_response(
        &self,
        response: hyper::Response<Body>,
        request: &mut Request,
        raw_request: Option<String>,
        deadline: Instant,
    ) -> Response {
        let (parts, body) = response.into_parts();
        let time = parts
            .extensions
            .get::<ExchangeTiming>()
            .and_then(ExchangeTiming::first_byte)
            .unwrap_or_default();

        let advertised = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());

        if let Some(size) = advertised {
            if self.config.ignore_body || size > MAX_DOWNLOAD_SIZE as i64 {
                log::debug!(
                    "Skipping body of {} ({} bytes advertised, ignore_body={})",
                    request.url,
                    size,
                    self.config.ignore_body
                );
                let mut shaped = Response::from_parts(&parts, request.clone());
                shaped.content_length = size;
                shaped.cancelled = true;
                shaped.time = time;
                return shaped;
            }
        }

        let data = read_body(body, deadline).await;

        let mut raw_response = None;
        if self.config.capture_raw() {
            raw_response = Some(format!(
                "{}{}",
                dump_head(&parts),
                String::from_utf8_lossy(&data)
            ));
            request.raw = raw_request;
        }

        let mut shaped = Response::from_parts(&parts, request.clone());
        shaped.set_data(data);
        shaped.time = time;
        shaped.raw = raw_response;
        shaped
    }
}

#[async_trait]
impl RunnerProvider for Runner {
    fn prepare(&self, input: &HashMap<String, Vec<u8>>) -> Result<Request, RunnerError> {
        Runner::prepare(self, input)
    }

    async fn execute(&self, request: &mut Request) -> Result<Response, RunnerError> {
        Runner::execute(self, request).await
    }
}

/// Parse the prepared URL as sent. Targets the strict parser rejects (spaces,
/// raw unicode) are retried through the lenient URL parser, which escapes them.
fn parse_url(raw: &str) -> Result<Uri, RunnerError> {
    let uri = match raw.parse::<Uri>() {
        Ok(uri) => uri,
        Err(strict) => Url::parse(raw)
            .ok()
            .and_then(|url| url.as_str().parse::<Uri>().ok())
            .ok_or_else(|| RunnerError::RequestBuild(format!("invalid URL {:?}: {}", raw, strict)))?,
    };

    match uri.scheme_str() {
        Some("http") | Some("https") => Ok(uri),
        _ => Err(RunnerError::RequestBuild(format!(
            "unsupported protocol scheme in URL {:?}",
            raw
        ))),
    }
}

/// Replace the path-and-query of `url` with the opaque target.
///
/// The target goes out verbatim when the strict parser takes it. Otherwise
/// the bytes it rejects are percent-escaped and everything else is kept.
/// Control bytes are refused.
fn request_target(url: &Uri, opaque: &str) -> Result<Uri, RunnerError> {
    if opaque.is_empty() {
        return Ok(url.clone());
    }
    if opaque.bytes().any(|b| b.is_ascii_control()) {
        return Err(RunnerError::RequestBuild(format!(
            "invalid control character in opaque target {:?}",
            opaque
        )));
    }

    let target = match opaque.parse::<PathAndQuery>() {
        Ok(target) if !opaque.contains('#') => target,
        _ => escape_target(opaque).parse::<PathAndQuery>().map_err(|e| {
            RunnerError::RequestBuild(format!("invalid opaque target {:?}: {}", opaque, e))
        })?,
    };
    let mut parts = url.clone().into_parts();
    parts.path_and_query = Some(target);
    Uri::from_parts(parts).map_err(|e| RunnerError::RequestBuild(e.to_string()))
}

/// Percent-escape the bytes a request target cannot carry as-is
fn escape_target(target: &str) -> String {
    let mut out = String::with_capacity(target.len());
    for b in target.bytes() {
        if b >= 0x80 || matches!(b, b' ' | b'"' | b'#' | b'<' | b'>' | b'`') {
            out.push_str(&format!("%{:02X}", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Serialize a hop the way it goes out on an HTTP/1.1 connection
fn dump_request(hop: &Hop) -> String {
    let target = hop
        .uri
        .path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/");
    let host = header_value(&hop.headers, "Host")
        .map(str::to_string)
        .or_else(|| hop.uri.authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default();

    let mut raw = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", hop.method, target, host);

    let mut headers: Vec<(&String, &String)> = hop
        .headers
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("Host"))
        .collect();
    headers.sort();
    for (name, value) in headers {
        raw.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !hop.body.is_empty() && header_value(&hop.headers, "Content-Length").is_none() {
        raw.push_str(&format!("Content-Length: {}\r\n", hop.body.len()));
    }
    raw.push_str("\r\n");
    raw.push_str(&String::from_utf8_lossy(&hop.body));
    raw
}

/// The next hop for a redirect response, if it is one we can follow
fn redirect_hop(hop: &Hop, response: &hyper::Response<Body>, origin: &str) -> Option<Hop> {
    let status = response.status().as_u16();
    if !matches!(status, 301 | 302 | 303 | 307 | 308) {
        return None;
    }

    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    let next = Url::parse(&hop.uri.to_string()).ok()?.join(location).ok()?;
    let uri: Uri = next.as_str().parse().ok()?;

    let keep_body = matches!(status, 307 | 308);
    let method = if keep_body || hop.method == Method::HEAD {
        hop.method.clone()
    } else {
        Method::GET
    };

    let same_origin = uri.authority().map(|a| a.as_str()) == Some(origin);
    let mut headers = hop.headers.clone();
    headers.retain(|name, _| {
        let name = name.to_ascii_lowercase();
        if !keep_body && (name == "content-length" || name == "content-type") {
            return false;
        }
        same_origin || !matches!(name.as_str(), "host" | "authorization" | "cookie" | "www-authenticate")
    });

    Some(Hop {
        method,
        uri,
        headers,
        body: if keep_body { hop.body.clone() } else { Vec::new() },
    })
}

/// Read the body up to `MAX_DOWNLOAD_SIZE`. Read errors and the deadline end
/// the read early; whatever arrived is kept.
async fn read_body(mut body: Body, deadline: Instant) -> Bytes {
    let mut data = BytesMut::new();
    loop {
        match timeout_at(deadline, body.data()).await {
            Ok(Some(Ok(chunk))) => {
                let room = MAX_DOWNLOAD_SIZE - data.len();
                if chunk.len() > room {
                    data.extend_from_slice(&chunk[..room]);
                    log::debug!("Response body truncated at {} bytes", MAX_DOWNLOAD_SIZE);
                    break;
                }
                data.extend_from_slice(&chunk);
            }
            Ok(Some(Err(e))) => {
                log::debug!("Error reading response body after {} bytes: {}", data.len(), e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                log::debug!("Timed out reading response body after {} bytes", data.len());
                break;
            }
        }
    }
    data.freeze()
}
