#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "debug";
#[cfg(debug_assertions)]
pub const CONFIGFILE_PATH: &str = "pubtunnel-client.yaml";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "info";
#[cfg(not(debug_assertions))]
pub const CONFIGFILE_PATH: &str = "/etc/pubtunnel-client.yaml";

// Reconnect backoff for the control connection
pub const RECONNECT_INITIAL_MS: u64 = 1_000;
pub const RECONNECT_MAX_MS: u64 = 60_000;
