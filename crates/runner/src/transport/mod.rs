//! Construction of the single HTTP client a runner owns.
//!
//! Connector layers, outermost first:
//!   trace  - connect timeout and time-to-first-byte hooks
//!   tls    - rustls without certificate verification, optional SNI override
//!   dial   - proxy selection, CONNECT tunnels, per-host connection cap

pub mod dial;
pub mod proxy;
pub mod tls;
pub mod trace;

use std::time::Duration;

use hyper::Body;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};

use crate::config::RunnerConfig;
use dial::DialConnector;
use proxy::ProxyPolicy;
use trace::TracedConnector;

pub use trace::ExchangeTiming;

/// Idle connections kept per host
pub const MAX_IDLE_CONNS_PER_HOST: usize = 500;
/// Open connections allowed per host
pub const MAX_CONNS_PER_HOST: usize = 500;
/// How long an idle pooled connection is kept
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);

/// The client type shared by every request of a runner
pub type FuzzClient = hyper::Client<TracedConnector<HttpsConnector<DialConnector>>, Body>;

/// Build the client for one runner role.
///
/// hyper's pool has no limit on idle connections across hosts, only the
/// per-host one.
pub fn build_client(config: &RunnerConfig, proxy: ProxyPolicy) -> FuzzClient {
    let timeout = config.timeout();
    let dial = DialConnector::new(proxy, timeout, MAX_CONNS_PER_HOST);

    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(tls::client_config())
        .https_or_http();
    let builder = if config.sni.is_empty() {
        builder
    } else {
        builder.with_server_name(config.sni.clone())
    };
    let https = builder.enable_http1().wrap_connector(dial);

    hyper::Client::builder()
        .pool_max_idle_per_host(MAX_IDLE_CONNS_PER_HOST)
        .pool_idle_timeout(IDLE_CONN_TIMEOUT)
        .http1_title_case_headers(true)
        .build(TracedConnector::new(https, timeout))
}
