use std::io;
use thiserror::Error;

/// The error taxonomy for one exchange.
///
/// An exchange only ever reacts to two buckets of failure: [`ProxyError::is_timeout`]
/// picks 504 vs. 502, everything else about the specific variant is for logging.
#[derive(Debug, Error)]
pub(crate) enum ProxyError {
    #[error("timed out")]
    Timeout,

    #[error("client closed the connection")]
    ClientClosed,

    #[error("upstream closed the connection")]
    UpstreamClosed,

    #[error("failed to connect to upstream: {0}")]
    DialFailure(#[source] io::Error),

    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),

    #[error("failed to write to upstream: {0}")]
    BackendWrite(#[source] io::Error),

    #[error("failed to write to client: {0}")]
    ClientWrite(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// `true` selects a 504, `false` a 502, for the variants that get a response at all.
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("config must list at least one upstream")]
    NoUpstreams,

    #[error("limits.{field} must be greater than zero")]
    NonPositiveLimit { field: &'static str },
}
