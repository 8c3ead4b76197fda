use std::time::Duration;

use thiserror::Error;

/// RunnerError represents every failure the runner surfaces to the scheduler.
///
/// Template parse failures never surface: `prepare` returns the request with the
/// host placeholders left unresolved. Body read errors keep the partial body.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The method, URL or a header was rejected while building the transport request
    #[error("failed to build request: {0}")]
    RequestBuild(String),

    /// Dial, TLS, write or read failure reported by the HTTP client
    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),

    /// The configured timeout elapsed before a response arrived
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The shared context was cancelled while the request was in flight
    #[error("request cancelled")]
    Cancelled,

    /// Proxy misconfiguration or a refused CONNECT tunnel
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Redirect chain exceeded the hop limit while following redirects
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration (de)serialization errors
    #[error("configuration error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    /// Returns true if the request ran out of time, either at connect or at response level
    pub fn is_timeout(&self) -> bool {
        match self {
            RunnerError::Timeout(_) => true,
            RunnerError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            RunnerError::Transport(e) => e.is_timeout() || connect_timed_out(e),
            _ => false,
        }
    }

    /// Returns true if the scheduler cancelled the request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunnerError::Cancelled)
    }

    /// Returns true for failures that happened on the wire rather than while building the request
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RunnerError::Transport(_)
                | RunnerError::Timeout(_)
                | RunnerError::Cancelled
                | RunnerError::Proxy(_)
                | RunnerError::Io(_)
                | RunnerError::TooManyRedirects(_)
        )
    }
}

/// Connector timeouts arrive wrapped in a hyper connect error
fn connect_timed_out(err: &hyper::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        if let Some(RunnerError::Timeout(_)) = cause.downcast_ref::<RunnerError>() {
            return true;
        }
        source = cause.source();
    }
    false
}
