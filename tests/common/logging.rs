//! Test logging setup.
//!
//! Installs a `tracing` fmt subscriber once per test binary. The filter comes
//! from `RUST_LOG` and defaults to `ordsched=debug`; output goes through the
//! test writer so it is only shown for failing tests.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("ordsched=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
