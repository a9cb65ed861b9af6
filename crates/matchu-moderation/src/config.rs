use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("MODERATION_BIND_ADDR `{value}` is not a socket address: {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

/// Moderation service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `model.onnx` and `tokenizer.json`.
    pub model_dir: PathBuf,
    /// Token cap per message, special tokens included.
    pub max_length: usize,
    pub bind_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_value =
            lookup("MODERATION_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8001".to_string());
        let bind_addr = bind_value
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_value.clone(),
                source,
            })?;

        Ok(Self {
            model_dir: lookup("MODERATION_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./model/chat_moderation_model_v3")),
            max_length: lookup("MODERATION_MAX_LENGTH")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(256)
                .max(2),
            bind_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("./model/chat_moderation_model_v3"));
        assert_eq!(config.max_length, 256);
        assert_eq!(config.bind_addr, "0.0.0.0:8001".parse().unwrap());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(|key| match key {
            "MODERATION_MAX_LENGTH" => Some("128".to_string()),
            "MODERATION_BIND_ADDR" => Some("127.0.0.1:9000".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_length, 128);
        assert_eq!(config.bind_addr.port(), 9000);
    }

    #[test]
    fn test_bad_bind_addr() {
        let result =
            Config::from_lookup(|key| (key == "MODERATION_BIND_ADDR").then(|| "nope".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidBindAddr { .. })));
    }
}
