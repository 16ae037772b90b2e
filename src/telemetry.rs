//! Logging configuration for opfixture
//!
//! Provides simple tracing-based logging, captured per test by the test
//! harness. No OTEL - fixtures are test infrastructure, not a service.
//!
//! # Example
//!
//! ```no_run
//! use opfixture::telemetry::init_logging;
//!
//! init_logging();
//! // Logs go to the test output with the configured level
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter variable checked before `RUST_LOG`
pub const ENV_LOG: &str = "OPFIXTURE_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging with tracing-subscriber
///
/// Uses `OPFIXTURE_LOG`, then `RUST_LOG` for filtering (default: info).
/// Safe to call from every test; only the first call installs anything.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
