use std::collections::HashMap;
use std::sync::Mutex;
use tokio::net::TcpStream;

use crate::config::Backend;

/// Per-backend bounded LIFO of reusable upstream connections.
///
/// Most-recently-released connection is served first, to maximize warm-TCP
/// reuse. There is no background health probing; liveness is a best-effort
/// check at the moment of [`UpstreamPool::acquire`] and [`UpstreamPool::release`].
pub(crate) struct UpstreamPool {
    max_idle: usize,
    stacks: Mutex<HashMap<Backend, Vec<TcpStream>>>,
}

impl UpstreamPool {
    pub(crate) fn new(max_idle: usize) -> Self {
        Self {
            max_idle,
            stacks: Mutex::new(HashMap::new()),
        }
    }

    /// Pops the most recently released connection for `backend`, if any, and
    /// if it still looks alive. Never dials; the caller dials on a `None`.
    pub(crate) fn acquire(&self, backend: &Backend) -> Option<TcpStream> {
        let mut guard = self.stacks.lock().unwrap();
        let stack = guard.get_mut(backend)?;
        while let Some(conn) = stack.pop() {
            if is_alive(&conn) {
                return Some(conn);
            }
        }
        None
    }

    /// Offers `conn` back to the pool. Dead connections are dropped; excess
    /// connections beyond `max_idle` are dropped too, never an older one.
    pub(crate) fn release(&self, backend: Backend, conn: TcpStream) {
        if !is_alive(&conn) {
            return;
        }
        let mut guard = self.stacks.lock().unwrap();
        let stack = guard.entry(backend).or_default();
        if stack.len() < self.max_idle {
            stack.push(conn);
        }
        // else: dropped, closing the socket.
    }

    #[cfg(test)]
    pub(crate) fn len(&self, backend: &Backend) -> usize {
        self.stacks
            .lock()
            .unwrap()
            .get(backend)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// A connection whose peer has sent EOF or reset is readable-ready with zero
/// bytes available; `try_read` returning `Ok(0)` or certain errors marks it dead.
fn is_alive(conn: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match conn.try_read(&mut buf) {
        Ok(0) => false,
        Ok(_) => false, // unsolicited bytes before reuse: treat as unsafe to reuse
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(port: u16) -> Backend {
        Backend {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn release_then_acquire_round_trips_a_healthy_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        std::mem::forget(server_side); // keep the peer open so `client` reads as alive
        let pool = UpstreamPool::new(4);
        let b = backend(addr.port());
        pool.release(b.clone(), client);
        assert_eq!(pool.len(&b), 1);
        assert!(pool.acquire(&b).is_some());
        assert_eq!(pool.len(&b), 0);
    }

    #[tokio::test]
    async fn acquire_on_empty_pool_returns_none() {
        let pool = UpstreamPool::new(4);
        assert!(pool.acquire(&backend(1)).is_none());
    }

    #[tokio::test]
    async fn overflow_drops_the_newly_released_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = UpstreamPool::new(1);
        let b = backend(addr.port());

        let c1 = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (s1, _) = listener.accept().await.unwrap();
        let c2 = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (s2, _) = listener.accept().await.unwrap();
        std::mem::forget(s1);
        std::mem::forget(s2);

        pool.release(b.clone(), c1);
        pool.release(b.clone(), c2);
        assert!(pool.len(&b) <= 1);
    }
}
