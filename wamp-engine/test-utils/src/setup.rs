use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a global subscriber that prints library logs for test runs.
///
/// Safe to call from every test; only the first call has any effect.
pub fn setup_test_environment() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing_core::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    });
}
