//! Logger bootstrap for binaries and tests.

use env_logger::{Builder, Env};

/// Installs the process logger once. Later calls are no-ops.
///
/// `RUST_LOG` wins when set; otherwise `info` and above are printed with a
/// millisecond timestamp and the emitting module path.
pub fn init_logging() {
    let _ = Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .format_target(true)
        .try_init();
}

/// Variant for test harnesses: output goes through the captured test writer.
pub fn init_test_logging() {
    let _ = Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
