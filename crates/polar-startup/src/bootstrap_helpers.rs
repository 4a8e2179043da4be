use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide fmt subscriber. `RUST_LOG` overrides the `warn` default.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    // A second call (tests, embedding hosts) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init();
}
