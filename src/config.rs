// Config Module - Configuration files for the intercom client and the exchange

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("{field} must be between 1 and 65535")]
    OutOfRange { field: &'static str },
    #[error("audio_port_min ({min}) exceeds audio_port_max ({max})")]
    InvertedPortRange { min: u16, max: u16 },
}

/// Client-side configuration. Immutable after startup except the phone
/// number, which the exchange may override at handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub server_hostname: String,
    pub server_port: u16,
    pub phone_number: u16,
    #[serde(default)]
    pub use_audio_defaults: bool,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_config(path)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_port(self.server_port, "server_port")?;
        require_port(self.phone_number, "phone_number")?;
        Ok(())
    }
}

/// Exchange-side configuration: the signalling port and the UDP range relay
/// ports are allocated from.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub server_port: u16,
    pub audio_port_min: u16,
    pub audio_port_max: u16,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_config(path)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_port(self.server_port, "server_port")?;
        require_port(self.audio_port_min, "audio_port_min")?;
        require_port(self.audio_port_max, "audio_port_max")?;
        if self.audio_port_min > self.audio_port_max {
            return Err(ConfigError::InvertedPortRange {
                min: self.audio_port_min,
                max: self.audio_port_max,
            });
        }
        Ok(())
    }
}

fn read_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// The type already caps the value at 65535; a u16 field is valid when it is
/// non-zero.
fn require_port(value: u16, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::OutOfRange { field });
    }
    Ok(())
}
