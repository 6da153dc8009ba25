//! Logging setup shared by the Prism apps.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
#[cfg(not(feature = "profiling-tracy"))]
const DEFAULT_FILTER: &str = "info";

/// With profiling on, the instrumented frame and trace spans are kept.
#[cfg(feature = "profiling-tracy")]
const DEFAULT_FILTER: &str =
    "info,prism_app=trace,prism_render=trace,prism_gpu=trace,prism_rt=trace";

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the default filter. Calling this more than once is
/// harmless; later calls leave the first subscriber in place.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    #[cfg(feature = "profiling-tracy")]
    let installed = {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_thread_names(true))
            .try_init()
            .is_ok()
    };
    #[cfg(not(feature = "profiling-tracy"))]
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok();

    if !installed {
        tracing::debug!("Logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_logging();
        init_logging();
        tracing::info!("still logging");
    }
}
