use tracing_subscriber::EnvFilter;

/// Filter from `VIFIT_LOG`, then `RUST_LOG`, then `info`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("VIFIT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the fmt subscriber. A second call (tests, embedding) is a no-op.
pub fn init_tracing(service: &str) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("[{}] tracing initialised", service);
    }
}
