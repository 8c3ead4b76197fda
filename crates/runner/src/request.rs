use std::collections::HashMap;

use crate::config::RunnerConfig;

/// A fully materialized request, produced by `Runner::prepare`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    /// HTTP method after substitution
    pub method: String,

    /// Target URL after substitution
    pub url: String,

    /// Raw request target override, sent verbatim when non-empty
    pub opaque: String,

    /// Effective Host, recorded by `execute`
    pub host: String,

    /// Request headers with canonical names
    pub headers: HashMap<String, String>,

    /// Request body
    pub data: Vec<u8>,

    /// The substitution map the request was prepared from
    pub input: HashMap<String, Vec<u8>>,

    /// Captured wire bytes of the request, when raw capture is enabled
    pub raw: Option<String>,
}

impl Request {
    /// Start a request from the unsubstituted template of the configuration
    pub fn from_template(config: &RunnerConfig) -> Self {
        Self {
            method: config.method.clone(),
            url: config.url.clone(),
            opaque: config.opaque.clone(),
            host: String::new(),
            headers: config.headers.clone(),
            data: config.data.clone().into_bytes(),
            input: HashMap::new(),
            raw: None,
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header is present, ignoring case
    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// The input value bound to a keyword, as text
    pub fn input_value(&self, keyword: &str) -> Option<String> {
        self.input
            .get(keyword)
            .map(|v| String::from_utf8_lossy(v).to_string())
    }
}
