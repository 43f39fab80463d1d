//! Hub configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// What the hub needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret every link must present when identifying.
    #[serde(default)]
    pub secret: String,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    44444
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            secret: String::new(),
        }
    }
}

impl HubConfig {
    pub fn new(address: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            secret: secret.into(),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Check the config can be served.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if !linkhub_core::is_nid(&self.secret) {
            return Err(ConfigError::InvalidSecret);
        }
        Ok(())
    }

    /// `address:port`, as given to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Error loading or validating a [`HubConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no secret configured")]
    MissingSecret,
    #[error("secret may only contain letters, digits and '-'")]
    InvalidSecret,
}
