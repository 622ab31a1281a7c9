use tracing_subscriber::EnvFilter;

pub use tracing::{debug, error, info, trace, warn};

pub enum LogType {
    Server,
    Client,
    Test,
}

/// Install the global tracing subscriber. `level` is the default filter,
/// overridable through `RUST_LOG`. Safe to call more than once (tests).
pub fn setup_logging(level: &str, log_type: LogType) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match log_type {
        LogType::Test => builder.with_test_writer().try_init(),
        LogType::Server | LogType::Client => builder.try_init(),
    };
    if installed.is_ok() {
        // Route `log` records from dependencies into tracing as well
        let _ = tracing_log::LogTracer::init();
    }
}
