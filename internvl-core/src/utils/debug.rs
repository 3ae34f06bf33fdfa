use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::DEBUG;

/// Install the global `tracing` subscriber. `RUST_LOG` takes precedence over the default level,
/// which is DEBUG when `INTERNVL_DEBUG=1` and INFO otherwise.
pub(crate) fn setup_logger_and_debug() {
    let is_debug = std::env::var("INTERNVL_DEBUG")
        .unwrap_or_default()
        .contains('1');
    DEBUG.store(is_debug, std::sync::atomic::Ordering::Relaxed);

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    // A subscriber may already be installed (e.g. by a test harness).
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
