/// Install a stderr `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` is used. Safe to call
/// more than once (later calls are no-ops), so tests can call it freely.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .try_init();
}
