use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Route driver logs through the test harness so they only show up for failing tests.
/// Safe to call from every test, only the first call installs the subscriber.
pub fn setup_tracing_subscriber_for_test() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy()
        .add_directive("docdb_driver=debug".parse().unwrap());
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init()
        .ok();
}
