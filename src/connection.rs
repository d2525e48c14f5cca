use crate::admission::AdmissionGates;
use crate::balancer::RoundRobin;
use crate::config::Config;
use crate::exchange::{self, ExchangeError, Outcome};
use crate::pool::UpstreamPool;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Drives successive exchanges over one client connection while the
/// connection's `CLIENT` admission permit is held. Each exchange gets its
/// own fresh deadline; no upstream connection is pinned across exchanges,
/// so successive requests on one keep-alive client may land on different
/// backends.
pub(crate) async fn run(
    mut client: TcpStream,
    config: Arc<Config>,
    pool: Arc<UpstreamPool>,
    gates: Arc<AdmissionGates>,
    balancer: Arc<RoundRobin>,
) {
    let mut leftover = Vec::new();

    loop {
        let backend = balancer.next().clone();
        match exchange::run_exchange(&mut client, &mut leftover, &config, &pool, &gates, backend).await {
            Ok(Outcome::KeepAlive) => continue,
            Ok(Outcome::Done) => break,
            Ok(Outcome::ClientGone) => break,
            Err(ExchangeError { err, response_started }) => {
                tracing::warn!(
                    status = if err.is_timeout() { 504 } else { 502 },
                    error = %err,
                    response_started,
                    "exchange failed"
                );
                if !response_started {
                    let _ = client.write_all(exchange::error_response(&err)).await;
                }
                break;
            }
        }
    }
}
