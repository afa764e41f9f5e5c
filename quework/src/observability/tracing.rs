use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global fmt subscriber. `RUST_LOG` overrides `default_filter`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
