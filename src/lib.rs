//! revproxy - a TCP-level HTTP/1.1 reverse proxy
//!
//! Accepts client connections, parses request framing, forwards to one of a
//! configured set of backends chosen by round robin, and relays the response
//! back. Per-backend idle connections are pooled, concurrency is bounded by
//! a global client gate plus per-backend gates, and every exchange runs
//! under a single monotonic deadline spanning its whole lifetime.
//!
//! # Protocol support
//!
//! HTTP/1.1 framing only: `Content-Length`, `Transfer-Encoding: chunked`, and
//! until-close response bodies. The proxy is transparent at the header
//! level - every header is forwarded verbatim, including hop-by-hop ones.
//! `Content-Length` takes precedence over `Transfer-Encoding` when a message
//! carries both, a deliberate divergence from RFC 9112.
//!
//! # Quick start
//!
//! ```no_run
//! use revproxy::{Config, Server};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() {
//!     revproxy::logging::init(None);
//!     let config = Config::load(Path::new("config.yaml")).expect("invalid config");
//!     let server = Server::new(config);
//!     server.run(std::future::pending()).await.expect("server failed");
//! }
//! ```
mod admission;
mod balancer;
mod body;
mod config;
mod connection;
mod deadline;
mod errors;
mod exchange;
mod framing;
pub mod logging;
mod pool;
mod server;

pub use crate::config::Config;
pub use crate::errors::ConfigError;
pub use crate::server::Server;
