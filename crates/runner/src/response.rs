use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use hyper::ext::ReasonPhrase;
use hyper::http::response::Parts;
use url::Url;

use crate::request::Request;
use crate::template::canonical_header_key;

/// Response shaped for the filter pipeline
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// HTTP status code
    pub status_code: u16,

    /// Response headers, canonical names, values in wire order
    pub headers: HashMap<String, Vec<String>>,

    /// Response body, empty when the read was skipped
    pub data: Bytes,

    /// Bytes read, or the advertised length when the body was skipped
    pub content_length: i64,

    /// Number of space-separated segments in the body
    pub content_words: i64,

    /// Number of newline-separated segments in the body
    pub content_lines: i64,

    /// Time from the end of the request write to the first response byte
    pub time: Duration,

    /// The body was deliberately not read
    pub cancelled: bool,

    /// The request this response answers
    pub request: Request,

    /// Captured response head and body, when raw capture is enabled
    pub raw: Option<String>,
}

impl Response {
    /// Build a response from the transport head. Body fields start out empty.
    pub fn from_parts(parts: &Parts, request: Request) -> Self {
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in parts.headers.iter() {
            headers
                .entry(canonical_header_key(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).to_string());
        }

        Self {
            status_code: parts.status.as_u16(),
            headers,
            request,
            ..Default::default()
        }
    }

    /// Set the body and derive the cheap content metrics from it
    pub fn set_data(&mut self, data: Bytes) {
        self.content_length = data.len() as i64;
        self.content_words = count_words(&data);
        self.content_lines = count_lines(&data);
        self.data = data;
    }

    /// Whether the status is 3xx
    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.status_code)
    }

    /// First value of a header, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// Get the response body as text (lossy)
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }

    /// The `Location` of a 3xx response, empty otherwise.
    ///
    /// With `absolute` the location is resolved against the request URL; if
    /// either side does not parse the location is returned as sent.
    pub fn redirect_location(&self, absolute: bool) -> String {
        if !self.is_redirection() {
            return String::new();
        }
        let location = match self.header("Location") {
            Some(location) => location.to_string(),
            None => return String::new(),
        };
        if !absolute {
            return location;
        }

        match Url::parse(&self.request.url) {
            Ok(base) => match base.join(&location) {
                Ok(resolved) => resolved.to_string(),
                Err(_) => location,
            },
            Err(_) => location,
        }
    }
}

/// Segments when splitting on a single space; an empty body counts as one
pub fn count_words(data: &[u8]) -> i64 {
    data.split(|b| *b == b' ').count() as i64
}

/// Segments when splitting on `\n`; an empty body counts as one
pub fn count_lines(data: &[u8]) -> i64 {
    data.split(|b| *b == b'\n').count() as i64
}

/// Serialize the status line and headers the way they arrived.
///
/// hyper only records the reason phrase when it differs from the canonical
/// one, so the canonical phrase is used otherwise.
pub(crate) fn dump_head(parts: &Parts) -> String {
    let reason = match parts.extensions.get::<ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).to_string(),
        None => parts.status.canonical_reason().unwrap_or("").to_string(),
    };
    let mut head = format!(
        "{:?} {} {}\r\n",
        parts.version,
        parts.status.as_u16(),
        reason
    );
    for (name, value) in parts.headers.iter() {
        head.push_str(&canonical_header_key(name.as_str()));
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}
