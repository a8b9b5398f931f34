mod schema;

pub use schema::*;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.proxy.redirect_timeout_ms == 0 || config.proxy.connect_timeout_ms == 0 {
        return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
    }
    if let Some(addr) = config.backends.iter().find(|addr| addr.rsplit_once(':').is_none()) {
        return Err(ConfigError::Invalid(format!("backend address {addr} has no port")));
    }
    Ok(())
}
