//! Tracing subscriber setup.
//!
//! Log output goes to stderr through a `fmt` layer. The filter comes from
//! `RUST_LOG` when set, otherwise from the default directive.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "streamline=info";

/// Build the filter, preferring `RUST_LOG` over `fallback`.
pub fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber. `verbose` lowers the default level to
/// `debug`. Calling this twice is harmless; the second call is ignored.
pub fn init_logging(verbose: bool) {
    let fallback = if verbose {
        "streamline=debug"
    } else {
        DEFAULT_FILTER
    };

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(env_filter(fallback)),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging(false);
        init_logging(true);
    }

    #[test]
    fn test_fallback_filter_parses() {
        let filter = EnvFilter::new(DEFAULT_FILTER);
        assert!(filter.to_string().contains("streamline"));
    }
}
