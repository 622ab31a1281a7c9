use std::{
    env,
    fs::read_to_string,
    sync::{Arc, OnceLock, RwLock},
};

use crate::consts::CONFIGFILE_PATH;

#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub broker: BrokerConfig,
    pub token: String,  // Encoded bearer token handed out by the broker
    pub origin: String, // Local service to publish, host:port
    pub tls: TlsConfig,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub insecure_skip_verify: bool,
    pub server_name: Option<String>, // SNI override, defaults to broker.host
}

impl ClientConfig {
    pub fn from_yaml_str(yaml_str: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml_str)
    }

    /// `_` separates the nesting: `BROKER_HOST` overrides `broker.host`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("BROKER_HOST") {
            self.broker.host = value;
        }
        if let Ok(value) = env::var("BROKER_PORT")
            && let Ok(port) = value.parse()
        {
            self.broker.port = port;
        }
        if let Ok(value) = env::var("TOKEN") {
            self.token = value;
        }
        if let Ok(value) = env::var("ORIGIN") {
            self.origin = value;
        }
        if let Ok(value) = env::var("TLS_ENABLED") {
            self.tls.enabled = value == "true" || value == "1";
        }
        if let Ok(value) = env::var("TLS_INSECURE_SKIP_VERIFY") {
            self.tls.insecure_skip_verify = value == "true" || value == "1";
        }
        if let Ok(value) = env::var("TLS_SERVER_NAME") {
            self.tls.server_name = Some(value);
        }
        if let Ok(value) = env::var("LOG_LEVEL") {
            self.log_level = Some(value);
        }
    }
}

pub fn get() -> Arc<RwLock<ClientConfig>> {
    static CLIENT_CONFIG: OnceLock<Arc<RwLock<ClientConfig>>> = OnceLock::new();

    CLIENT_CONFIG
        .get_or_init(|| {
            let mut config = if let Ok(config_str) = read_to_string(CONFIGFILE_PATH) {
                ClientConfig::from_yaml_str(&config_str)
                    .expect("Failed to parse client configuration file")
            } else {
                ClientConfig::default()
            };
            config.apply_env_overrides();
            Arc::new(RwLock::new(config))
        })
        .clone()
}
