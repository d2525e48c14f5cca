use crate::admission::AdmissionGates;
use crate::balancer::RoundRobin;
use crate::config::Config;
use crate::connection;
use crate::pool::UpstreamPool;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Binds the listener and accepts connections, spawning one task per client.
/// The `CLIENT` admission permit is acquired before the task is spawned and
/// held for that connection's entire keep-alive lifetime, dropping only when
/// the spawned task ends.
pub struct Server {
    config: Arc<Config>,
    pool: Arc<UpstreamPool>,
    gates: Arc<AdmissionGates>,
    balancer: Arc<RoundRobin>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let pool = Arc::new(UpstreamPool::new(config.limits.max_idle));
        let gates = Arc::new(AdmissionGates::new(
            config.limits.max_client_conns,
            config.limits.max_conns_per_upstream,
            &config.backends,
        ));
        let balancer = Arc::new(RoundRobin::new(config.backends.clone()));
        Self {
            config: Arc::new(config),
            pool,
            gates,
            balancer,
        }
    }

    /// Binds the listen address and runs the accept loop until `shutdown` resolves.
    /// Shutdown stops accepting new connections; exchanges already in flight are
    /// allowed to drain rather than being cancelled.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) -> std::io::Result<()> {
        let listener = bind_with_backlog(&self.config.listen, self.config.backlog).await?;
        tracing::info!(addr = %self.config.listen, "listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!("shutting down, no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    self.spawn_connection(stream, peer);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        let client_gate = self.gates.client();
        let config = Arc::clone(&self.config);
        let pool = Arc::clone(&self.pool);
        let gates = Arc::clone(&self.gates);
        let balancer = Arc::clone(&self.balancer);

        tokio::spawn(async move {
            let permit = client_gate
                .acquire_owned()
                .await
                .expect("client semaphore is never closed");
            tracing::debug!(%peer, "accepted");
            connection::run(stream, config, pool, gates, balancer).await;
            drop(permit);
        });
    }
}

async fn bind_with_backlog(addr: &str, backlog: u32) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Socket, Type};
    let sock_addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid listen address"))?;
    let domain = if sock_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr.into())?;
    socket.listen(backlog as i32)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, Limits, Timeouts};
    use std::time::Duration;

    fn test_config(port: u16) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            backends: vec![Backend {
                host: "127.0.0.1".to_string(),
                port,
            }],
            timeouts: Timeouts {
                connect: Duration::from_millis(200),
                read: Duration::from_millis(200),
                write: Duration::from_millis(200),
                total: Duration::from_millis(500),
            },
            limits: Limits {
                max_client_conns: 2,
                max_conns_per_upstream: 2,
                max_idle: 4,
            },
            backlog: 128,
        }
    }

    #[test]
    fn server_construction_builds_one_gate_per_backend() {
        let server = Server::new(test_config(9));
        assert_eq!(server.balancer.next().port, 9);
    }
}
