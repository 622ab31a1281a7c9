pub const VERSION: &str = "v1.0.0";

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "debug";
#[cfg(debug_assertions)]
pub const CONFIGFILE_PATH: &str = "pubtunnel.yaml";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "info";
#[cfg(not(debug_assertions))]
pub const CONFIGFILE_PATH: &str = "/etc/pubtunnel.yaml";

// Edge HTTP constants
pub const DEFAULT_MAX_CONNS_PER_KEY: usize = 4;
pub const REQUEST_HEAD_MAX: usize = 16 * 1024;
pub const REQUEST_BODY_MAX: usize = 64 * 1024;
pub const HTTP_HEAD_TIMEOUT_MS: u64 = 5_000;
pub const HTTP_WRITE_TIMEOUT_MS: u64 = 5_000;
pub const PROXY_HEAD_TIMEOUT_MS: u64 = 5_000;

// Tunnel handshake must finish quickly, slow peers are dropped
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
pub const PONG_TIMEOUT_MS: u64 = 1_000;

// Token issuance
pub const TOKEN_SAVE_RETRIES: usize = 3;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 86_400;

// Secret hashing, fixed process wide. The scheme prefix on stored digests
// leaves room to rotate these without reinterpreting old records.
pub const SCRYPT_LOG_N: u8 = 15;
pub const SCRYPT_R: u32 = 8;
pub const SCRYPT_P: u32 = 1;
pub const SCRYPT_DIGEST_LEN: usize = 32;
pub const DIGEST_SCHEME_PREFIX: &str = "scrypt:";
