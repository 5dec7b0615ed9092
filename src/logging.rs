use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber: compact stdout output, filter
/// taken from `RUST_LOG` with `info` as the default. Calling it again is a
/// no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
