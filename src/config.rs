use crate::errors::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// A backend's identity: a `(host, port)` pair. Immutable once the config is
/// loaded; used as the key into the idle pool and the per-backend semaphores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Backend {
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Timeouts {
    pub(crate) connect: Duration,
    pub(crate) read: Duration,
    pub(crate) write: Duration,
    pub(crate) total: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub(crate) max_client_conns: usize,
    pub(crate) max_conns_per_upstream: usize,
    pub(crate) max_idle: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) listen: String,
    pub(crate) backends: Vec<Backend>,
    pub(crate) timeouts: Timeouts,
    pub(crate) limits: Limits,
    pub(crate) backlog: u32,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = serde_yaml::from_str(&text)?;
        raw.validate()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    listen: Option<String>,
    upstreams: Vec<RawUpstream>,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    limits: RawLimits,
    max_idle: Option<usize>,
    backlog: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawUpstream {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RawTimeouts {
    connect_ms: Option<u64>,
    read_ms: Option<u64>,
    write_ms: Option<u64>,
    total_ms: Option<u64>,
}

impl Default for RawTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: None,
            read_ms: None,
            write_ms: None,
            total_ms: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    max_client_conns: Option<usize>,
    max_conns_per_upstream: Option<usize>,
}

impl Default for RawLimits {
    fn default() -> Self {
        Self {
            max_client_conns: None,
            max_conns_per_upstream: None,
        }
    }
}

impl RawConfig {
    fn validate(self) -> Result<Config, ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }
        let backends = self
            .upstreams
            .into_iter()
            .map(|u| Backend {
                host: u.host,
                port: u.port,
            })
            .collect();

        let max_client_conns = self.limits.max_client_conns.unwrap_or(100);
        let max_conns_per_upstream = self.limits.max_conns_per_upstream.unwrap_or(10);
        if max_client_conns == 0 {
            return Err(ConfigError::NonPositiveLimit { field: "max_client_conns" });
        }
        if max_conns_per_upstream == 0 {
            return Err(ConfigError::NonPositiveLimit { field: "max_conns_per_upstream" });
        }

        Ok(Config {
            listen: self.listen.unwrap_or_else(|| "127.0.0.1:8888".to_string()),
            backends,
            timeouts: Timeouts {
                connect: Duration::from_millis(self.timeouts.connect_ms.unwrap_or(1_000)),
                read: Duration::from_millis(self.timeouts.read_ms.unwrap_or(5_000)),
                write: Duration::from_millis(self.timeouts.write_ms.unwrap_or(5_000)),
                total: Duration::from_millis(self.timeouts.total_ms.unwrap_or(30_000)),
            },
            limits: Limits {
                max_client_conns,
                max_conns_per_upstream,
                max_idle: self.max_idle.unwrap_or(100),
            },
            backlog: self.backlog.unwrap_or(8192),
        })
    }
}
