use tracing_subscriber::{prelude::*, util::TryInitError, EnvFilter, Registry};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber: an stderr formatter filtered by `RUST_LOG`.
/// Fails if a global subscriber was already installed.
pub fn try_init() -> Result<(), TryInitError> {
    let subscriber = Registry::default();

    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    subscriber.with(fmt_layer).try_init()
}

/// Like [`try_init`], but keeps an already installed subscriber.
pub fn init() {
    if try_init().is_err() {
        tracing::debug!("a global subscriber was already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        init();
        assert!(try_init().is_err());
        tracing::info!("still logging");
    }
}
