//! Logging initialization and configuration.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor a configured level is present.
pub const DEFAULT_FILTER: &str = "knoboo=info";

fn build_filter(level: Option<&str>) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    match level {
        // A bare level like "debug" applies to this crate only.
        Some(level) if !level.contains('=') && !level.contains(',') => {
            EnvFilter::new(format!("knoboo={level}"))
        }
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new(DEFAULT_FILTER),
    }
}

/// Initialize the logging system.
///
/// `RUST_LOG` takes precedence over `level`. Without either the filter
/// defaults to `knoboo=info`.
///
/// # Panics
///
/// Panics if called more than once, or if another tracing subscriber
/// has already been set.
pub fn init(level: Option<&str>) {
    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// Try to initialize the logging system.
///
/// Returns `Err` if logging has already been initialized.
pub fn try_init(level: Option<&str>) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()
}
