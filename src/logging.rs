use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber::fmt` subscriber once, at process startup.
/// `filter` overrides `RUST_LOG`; pass `None` to use the environment (or `info`
/// if unset).
pub fn init(filter: Option<&str>) {
    let env_filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();
}
