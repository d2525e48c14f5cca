use crate::config::Backend;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// The two-layer admission gate: one global `CLIENT` semaphore held for the
/// lifetime of a client connection, and one `UP[backend]` semaphore acquired
/// per exchange, scoping both the upstream acquisition and the forwarding
/// itself. Built once at startup from configuration; never mutated after.
pub(crate) struct AdmissionGates {
    client: Arc<Semaphore>,
    per_upstream: HashMap<Backend, Arc<Semaphore>>,
}

impl AdmissionGates {
    pub(crate) fn new(max_client_conns: usize, max_conns_per_upstream: usize, backends: &[Backend]) -> Self {
        let per_upstream = backends
            .iter()
            .cloned()
            .map(|b| (b, Arc::new(Semaphore::new(max_conns_per_upstream))))
            .collect();
        Self {
            client: Arc::new(Semaphore::new(max_client_conns)),
            per_upstream,
        }
    }

    pub(crate) fn client(&self) -> Arc<Semaphore> {
        Arc::clone(&self.client)
    }

    pub(crate) fn upstream(&self, backend: &Backend) -> Arc<Semaphore> {
        Arc::clone(
            self.per_upstream
                .get(backend)
                .expect("backend not present in admission gates; built from the same list as the balancer"),
        )
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
    async fn client_gate_bounds_concurrent_permits() {
        let gates = AdmissionGates::new(1, 5, &[backend(1)]);
        let permit = gates.client().try_acquire_owned().unwrap();
        assert!(gates.client().try_acquire_owned().is_err());
        drop(permit);
        assert!(gates.client().try_acquire_owned().is_ok());
    }

    #[tokio::test]
    async fn per_upstream_gates_are_independent() {
        let gates = AdmissionGates::new(10, 1, &[backend(1), backend(2)]);
        let _p1 = gates.upstream(&backend(1)).try_acquire_owned().unwrap();
        assert!(gates.upstream(&backend(2)).try_acquire_owned().is_ok());
        assert!(gates.upstream(&backend(1)).try_acquire_owned().is_err());
    }
}
