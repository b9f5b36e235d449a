use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{GatewayError, Result};

/// Gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Client id presented to every upstream broker.
    pub id: String,

    /// HTTP listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the SQLite database file.
    pub database: String,

    /// Upstream brokers, keyed by the server name used in station identities.
    #[serde(default)]
    pub brokers: HashMap<String, String>,
}

fn default_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| GatewayError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| GatewayError::Config(format!("Failed to parse config: {e}")))
    }
}
