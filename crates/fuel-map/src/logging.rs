/*!
Logging setup for the fuel-map binary.

`RUST_LOG` controls the filter as usual. When it is unset, debug builds log
this crate at debug level and everything else at info; release builds log at
info.

With the `profiling` feature, profiling scopes are emitted as tracing spans and
their durations are logged when each span closes.
*/

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is not set
pub fn default_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "info,fuel_map=debug,fuel_map_lib=debug,hyper_util=info,reqwest::connect=info"
    } else {
        "info"
    }
}

/// Install the global tracing subscriber
///
/// Calling this more than once is harmless; later calls keep the first
/// subscriber.
pub fn setup_logging() {
    let from_env = std::env::var("RUST_LOG").is_ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter()));

    #[cfg(feature = "profiling")]
    let fmt_layer = fmt::layer().with_span_events(fmt::format::FmtSpan::CLOSE);
    #[cfg(not(feature = "profiling"))]
    let fmt_layer = fmt::layer();

    let installed = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init()
        .is_ok();

    if installed && !from_env {
        tracing::info!("RUST_LOG set to default: {}", default_filter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(default_filter()).is_ok());
    }

    #[test]
    fn test_setup_twice() {
        setup_logging();
        setup_logging();
        tracing::debug!("Logging still works");
    }
}
