//! Subscriber initialization.
//!
//! Filtering comes from `RUST_LOG`. Production output is one JSON object per
//! event so throttle decisions (`strategy`, `queue`, `job_id` fields) can be
//! queried by log pipelines.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";
const DEFAULT_TEST_FILTER: &str = "debug";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// JSON logs with timestamps.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(DEFAULT_FILTER))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Compact logs routed through the test writer, so they only show for
/// failing tests.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(DEFAULT_TEST_FILTER))
        .with_test_writer()
        .compact()
        .try_init();
}
