//! Shared helpers for integration tests

/// Route `tracing` output through the test harness.
///
/// Set `RUST_LOG=skein_dispatch=trace` to see worker activity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
