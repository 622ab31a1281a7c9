// Health ping cadence on registered control connections
pub const PING_INTERVAL_MS: u64 = 200;

// Dial timeout used on every outgoing TCP connection (broker, origin)
pub const DIAL_TIMEOUT_MS: u64 = 5_000;

// Copy buffer for the bidirectional splice
pub const COPY_BUFFER_SIZE: usize = 8192;

// Token related constants
pub const TOKEN_ID_LENGTH: usize = 8;
pub const TOKEN_SECRET_LENGTH: usize = 32;
