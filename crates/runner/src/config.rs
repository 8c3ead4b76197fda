use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::RunnerError;

/// Default timeout in seconds applied to dial, TLS handshake and the whole request
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Runner configuration.
///
/// The request template (`url`, `method`, `data`, `opaque`, `headers`) may
/// contain fuzzing keywords as well as the `{HOST}`, `{HOSTPORT}` and `{PORT}`
/// placeholders. The record is read-only once a runner has been built from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Templated target URL
    pub url: String,
    /// Templated HTTP method
    pub method: String,
    /// Templated request body
    pub data: String,
    /// Templated raw request target, sent verbatim when non-empty
    pub opaque: String,
    /// Templated request headers
    pub headers: HashMap<String, String>,
    /// Timeout in seconds
    pub timeout: u64,
    /// Proxy used by the primary runner
    pub proxy_url: String,
    /// Proxy used by the replay runner
    pub replay_proxy_url: String,
    /// TLS server name override
    pub sni: String,
    /// Whether 3xx responses are followed
    pub follow_redirects: bool,
    /// Skip reading response bodies entirely
    pub ignore_body: bool,
    /// Non-empty enables raw request/response capture
    pub output_directory: String,
    /// Cancellation handle shared with the scheduler
    #[serde(skip)]
    pub context: Context,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            data: String::new(),
            opaque: String::new(),
            headers: HashMap::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            proxy_url: String::new(),
            replay_proxy_url: String::new(),
            sni: String::new(),
            follow_redirects: false,
            ignore_body: false,
            output_directory: String::new(),
            context: Context::new(),
        }
    }
}

impl RunnerConfig {
    /// Create a configuration for the given URL template with default settings
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Parse a configuration from a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, RunnerError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The configured timeout, never shorter than one second
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    /// Whether raw request/response bytes should be captured
    pub fn capture_raw(&self) -> bool {
        !self.output_directory.is_empty()
    }

    /// The proxy URL for the given role
    pub fn proxy_for(&self, replay: bool) -> &str {
        if replay {
            &self.replay_proxy_url
        } else {
            &self.proxy_url
        }
    }
}
