use crate::admission::AdmissionGates;
use crate::body::{self, IoBudget};
use crate::config::{Backend, Config};
use crate::deadline::Deadline;
use crate::errors::ProxyError;
use crate::framing::{self, Framing};
use crate::pool::UpstreamPool;
use std::sync::Arc;
use tokio::net::TcpStream;

pub(crate) const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\nContent-Length: 11\r\n\r\nBad Gateway";
pub(crate) const GATEWAY_TIMEOUT: &[u8] =
    b"HTTP/1.1 504 Gateway Timeout\r\nConnection: close\r\nContent-Length: 15\r\n\r\nGateway Timeout";

/// How one exchange ended, from the keep-alive loop's point of view.
pub(crate) enum Outcome {
    /// A response was sent and `Connection: close` was not requested by either side.
    KeepAlive,
    /// A response was sent (or the body was forwarded until close); the loop must end.
    Done,
    /// The client closed before sending a full request. No response was sent.
    ClientGone,
}

/// A failed exchange, tagged with whether a real response head had already
/// reached the client before the failure. Once that's true, a literal
/// 502/504 must never be appended - it would corrupt a response the client
/// is already mid-way through reading.
pub(crate) struct ExchangeError {
    pub(crate) err: ProxyError,
    pub(crate) response_started: bool,
}

impl ExchangeError {
    fn before_response(err: ProxyError) -> Self {
        Self { err, response_started: false }
    }

    fn after_response(err: ProxyError) -> Self {
        Self { err, response_started: true }
    }
}

/// Offers an upstream connection back to the pool exactly once, on every exit
/// path, regardless of whether the exchange that borrowed it succeeded.
struct ConnGuard<'a> {
    pool: &'a UpstreamPool,
    backend: Backend,
    conn: Option<TcpStream>,
}

impl<'a> ConnGuard<'a> {
    fn new(pool: &'a UpstreamPool, backend: Backend, conn: TcpStream) -> Self {
        Self {
            pool,
            backend,
            conn: Some(conn),
        }
    }

    fn stream(&mut self) -> &mut TcpStream {
        self.conn.as_mut().expect("connection taken from guard before drop")
    }
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.backend.clone(), conn);
        }
    }
}

/// Runs one full client↔upstream exchange: reads the client's request, dials
/// or reuses an upstream connection under the per-backend admission gate,
/// forwards the request and response, and releases the connection back to
/// the pool on every exit path (success or failure alike).
pub(crate) async fn run_exchange(
    client: &mut TcpStream,
    client_leftover: &mut Vec<u8>,
    config: &Config,
    pool: &Arc<UpstreamPool>,
    gates: &Arc<AdmissionGates>,
    backend: Backend,
) -> Result<Outcome, ExchangeError> {
    let deadline = Deadline::new(config.timeouts.total);

    let head = match framing::read_headers(client, client_leftover, &deadline, config.timeouts.read).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(Outcome::ClientGone),
        Err(ProxyError::MalformedRequest(_)) => return Ok(Outcome::ClientGone),
        Err(e) => return Err(ExchangeError::before_response(e)),
    };

    let permit = gates.upstream(&backend);
    let _permit = tokio::time::timeout(deadline.budget(config.timeouts.total), permit.acquire_owned())
        .await
        .map_err(|_| ExchangeError::before_response(ProxyError::Timeout))?
        .expect("upstream semaphore is never closed");

    let upstream_conn = match pool.acquire(&backend) {
        Some(conn) => conn,
        None => dial(&backend, &deadline, config.timeouts.connect)
            .await
            .map_err(ExchangeError::before_response)?,
    };
    let mut guard = ConnGuard::new(pool, backend.clone(), upstream_conn);

    let write_budget = IoBudget {
        read: config.timeouts.read,
        write: config.timeouts.write,
    };

    // Step 5: forward the raw request header block.
    write_exact(guard.stream(), &head.raw, &deadline, config.timeouts.write, ProxyError::BackendWrite)
        .await
        .map_err(ExchangeError::before_response)?;

    // Step 6: forward the request body under the framing the client declared.
    match head.request_framing().map_err(ExchangeError::before_response)? {
        Framing::Fixed(n) if n > 0 => {
            body::forward_fixed(
                n,
                client,
                client_leftover,
                guard.stream(),
                &deadline,
                &write_budget,
                ProxyError::BackendWrite,
                || ProxyError::ClientClosed,
            )
            .await
            .map_err(ExchangeError::before_response)?;
        }
        Framing::Chunked => {
            body::forward_chunked(
                client,
                client_leftover,
                guard.stream(),
                &deadline,
                &write_budget,
                ProxyError::BackendWrite,
                || ProxyError::ClientClosed,
            )
            .await
            .map_err(ExchangeError::before_response)?;
        }
        _ => {}
    }

    // Step 7: read the response headers from upstream and forward them verbatim.
    // Nothing has reached the client yet, so failures up to and including this
    // write are still reported as a literal 502/504.
    let mut upstream_leftover = Vec::new();
    let resp_head = {
        let stream = guard.stream();
        framing::read_headers(stream, &mut upstream_leftover, &deadline, config.timeouts.read)
            .await
            .map_err(ExchangeError::before_response)?
            .ok_or(ProxyError::UpstreamClosed)
            .map_err(ExchangeError::before_response)?
    };
    write_exact(client, &resp_head.raw, &deadline, config.timeouts.write, ProxyError::ClientWrite)
        .await
        .map_err(ExchangeError::before_response)?;

    // Step 8: forward the response body under the framing upstream declared.
    // From here on the client has a real response head in hand; any failure
    // must close the connection outright rather than append a literal error body.
    let response_framing = resp_head.response_framing().map_err(ExchangeError::after_response)?;
    let mut keep_alive_possible = matches!(response_framing, Framing::Fixed(_) | Framing::Chunked);
    match response_framing {
        Framing::Fixed(n) if n > 0 => {
            let stream = guard.stream();
            body::forward_fixed(
                n,
                stream,
                &mut upstream_leftover,
                client,
                &deadline,
                &write_budget,
                ProxyError::ClientWrite,
                || ProxyError::UpstreamClosed,
            )
            .await
            .map_err(ExchangeError::after_response)?;
        }
        Framing::Chunked => {
            let stream = guard.stream();
            body::forward_chunked(
                stream,
                &mut upstream_leftover,
                client,
                &deadline,
                &write_budget,
                ProxyError::ClientWrite,
                || ProxyError::UpstreamClosed,
            )
            .await
            .map_err(ExchangeError::after_response)?;
        }
        Framing::UntilClose => {
            let stream = guard.stream();
            body::forward_until_close(
                stream,
                &mut upstream_leftover,
                client,
                &deadline,
                &write_budget,
                ProxyError::ClientWrite,
            )
            .await
            .map_err(ExchangeError::after_response)?;
            keep_alive_possible = false;
        }
        _ => {}
    }

    // Step 10: keep-alive iff neither side asked to close, and the response
    // framing allowed it (until-close responses always end the connection).
    if head.wants_close() || resp_head.wants_close() || !keep_alive_possible {
        Ok(Outcome::Done)
    } else {
        Ok(Outcome::KeepAlive)
    }
}

async fn write_exact(
    stream: &mut TcpStream,
    bytes: &[u8],
    deadline: &Deadline,
    write_cap: std::time::Duration,
    on_err: fn(std::io::Error) -> ProxyError,
) -> Result<(), ProxyError> {
    use tokio::io::AsyncWriteExt;
    let budget = deadline.budget(write_cap);
    tokio::time::timeout(budget, stream.write_all(bytes))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(on_err)
}

async fn dial(backend: &Backend, deadline: &Deadline, connect_cap: std::time::Duration) -> Result<TcpStream, ProxyError> {
    let budget = deadline.budget(connect_cap);
    let addr = format!("{}:{}", backend.host, backend.port);
    let conn = tokio::time::timeout(budget, TcpStream::connect(&addr))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(ProxyError::DialFailure)?;
    conn.set_nodelay(true).map_err(ProxyError::DialFailure)?;
    Ok(conn)
}

/// Picks the literal error response for a failed exchange: 504 for timeouts,
/// 502 for everything else that gets a response at all.
pub(crate) fn error_response(err: &ProxyError) -> &'static [u8] {
    if err.is_timeout() {
        GATEWAY_TIMEOUT
    } else {
        BAD_GATEWAY
    }
}
