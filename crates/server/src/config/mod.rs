use std::{
    env,
    fs::read_to_string,
    sync::{Arc, OnceLock, RwLock},
};

use crate::consts::{CONFIGFILE_PATH, DEFAULT_MAX_CONNS_PER_KEY};

#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub tunnel: TunnelConfig,
    pub api: ApiConfig,
    pub auth: AuthConfig,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String, // Edge listen address, default: 0.0.0.0:8080
    pub domain: String, // Public suffix; keys become <key>.<domain>
    pub schema: String, // Used when generating public URLs, default: http
    pub public_port: Option<u16>, // Appended to public URLs when set
    pub max_conns_per_key: usize, // Per key in-flight request cap
    pub use_proxy_protocol: bool, // Expect PROXY v1/v2 preamble on the edge
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            listen: "0.0.0.0:8080".to_string(),
            domain: "localhost".to_string(),
            schema: "http".to_string(),
            public_port: None,
            max_conns_per_key: DEFAULT_MAX_CONNS_PER_KEY,
            use_proxy_protocol: false,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub listen: String, // Reverse tunnel listen address, default: 0.0.0.0:8081
    pub cert_path: Option<String>, // PEM certificate chain; TLS off when unset
    pub key_path: Option<String>, // PEM private key
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            listen: "0.0.0.0:8081".to_string(),
            cert_path: None,
            key_path: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: Option<String>, // Management API; disabled when unset
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub storage_url: Option<String>, // redis:// url; in-memory store when unset
    pub salt: String,                // Process level salt for secret hashing
    pub key_prefix: String,          // Storage key namespace
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            storage_url: None,
            salt: "pubtunnel".to_string(),
            key_prefix: "key:".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_yaml_str(yaml_str: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml_str)
    }

    /// Environment variables override file values, `_` separating the
    /// nesting: `HTTP_LISTEN` overrides `http.listen`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("HTTP_LISTEN") {
            self.http.listen = value;
        }
        if let Ok(value) = env::var("HTTP_DOMAIN") {
            self.http.domain = value;
        }
        if let Ok(value) = env::var("HTTP_SCHEMA") {
            self.http.schema = value;
        }
        if let Ok(value) = env::var("HTTP_PUBLIC_PORT")
            && let Ok(port) = value.parse()
        {
            self.http.public_port = Some(port);
        }
        if let Ok(value) = env::var("HTTP_MAX_CONNS_PER_KEY")
            && let Ok(limit) = value.parse()
        {
            self.http.max_conns_per_key = limit;
        }
        if let Ok(value) = env::var("HTTP_USE_PROXY_PROTOCOL") {
            self.http.use_proxy_protocol = value == "true" || value == "1";
        }
        if let Ok(value) = env::var("TUNNEL_LISTEN") {
            self.tunnel.listen = value;
        }
        if let Ok(value) = env::var("TUNNEL_CERT_PATH") {
            self.tunnel.cert_path = Some(value);
        }
        if let Ok(value) = env::var("TUNNEL_KEY_PATH") {
            self.tunnel.key_path = Some(value);
        }
        if let Ok(value) = env::var("API_LISTEN") {
            self.api.listen = Some(value);
        }
        if let Ok(value) = env::var("AUTH_STORAGE_URL") {
            self.auth.storage_url = Some(value);
        }
        if let Ok(value) = env::var("AUTH_SALT") {
            self.auth.salt = value;
        }
        if let Ok(value) = env::var("AUTH_KEY_PREFIX") {
            self.auth.key_prefix = value;
        }
        if let Ok(value) = env::var("LOG_LEVEL") {
            self.log_level = Some(value);
        }
    }
}

pub fn get() -> Arc<RwLock<ServerConfig>> {
    // Global shared configuration, maybe modified on runtime (and by tests also)
    // so it's convenient to have it behind a RwLock
    static SERVER_CONFIG: OnceLock<Arc<RwLock<ServerConfig>>> = OnceLock::new();

    SERVER_CONFIG
        .get_or_init(|| {
            let mut config = if let Ok(config_str) = read_to_string(CONFIGFILE_PATH) {
                ServerConfig::from_yaml_str(&config_str)
                    .expect("Failed to parse server configuration file")
            } else {
                ServerConfig::default()
            };
            config.apply_env_overrides();
            Arc::new(RwLock::new(config))
        })
        .clone()
}
