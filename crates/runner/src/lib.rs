pub mod config;
pub mod context;
pub mod error;
pub mod request;
pub mod response;
pub mod runner;
pub mod template;
pub mod transport;

/// Re-export common types for easier usage
pub use config::RunnerConfig;
pub use context::Context;
pub use error::RunnerError;
pub use request::Request;
pub use response::Response;
pub use runner::{
    default_user_agent, new_runner, Runner, RunnerProvider, DEFAULT_USER_AGENT,
    MAX_DOWNLOAD_SIZE, MAX_REDIRECTS,
};
pub use template::{HOSTPORT_KEYWORD, HOST_KEYWORD, PORT_KEYWORD};
pub use transport::ExchangeTiming;
