use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use matchu_core::EngineSettings;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("BIND_ADDR `{value}` is not a socket address: {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Service name reported by `GET /`.
    pub app_name: String,
    pub app_version: String,
    /// Minimum cosine similarity for a positive match, in [0, 1].
    pub similarity_threshold: f32,
    /// Per-file upload cap in megabytes (at least 1).
    pub max_upload_size_mb: usize,
    /// InsightFace model pack name under `model_root`.
    pub model_name: String,
    /// Negative selects the CPU; otherwise a CUDA device id.
    pub ctx_id: i32,
    pub det_size: u32,
    pub model_root: PathBuf,
    /// Cooldown after a failed engine construction.
    pub retry_interval: Duration,
    /// Allowed CORS origins; `["*"]` allows any origin.
    pub cors_allow_origins: Vec<String>,
    pub bind_addr: SocketAddr,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<i64>().ok());

        let model_root = lookup("INSIGHTFACE_MODEL_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".insightface/models")
            });

        let bind_value = lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string());
        let bind_addr = bind_value
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_value.clone(),
                source,
            })?;

        let threshold = lookup("SIMILARITY_THRESHOLD")
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| !v.is_nan())
            .unwrap_or(0.65);

        Ok(Self {
            app_name: lookup("APP_NAME")
                .unwrap_or_else(|| "MatchU Verification Backend".to_string()),
            app_version: lookup("APP_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            similarity_threshold: threshold.clamp(0.0, 1.0),
            max_upload_size_mb: at_least(parsed("MAX_UPLOAD_SIZE_MB"), 10, 1) as usize,
            model_name: lookup("INSIGHTFACE_MODEL_NAME").unwrap_or_else(|| "buffalo_l".to_string()),
            ctx_id: parsed("INSIGHTFACE_CTX_ID")
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(-1),
            det_size: at_least(parsed("INSIGHTFACE_DET_SIZE"), 640, 64).min(u32::MAX as i64) as u32,
            model_root,
            retry_interval: Duration::from_secs(
                at_least(parsed("ENGINE_RETRY_INTERVAL_SECS"), 15, 1) as u64,
            ),
            cors_allow_origins: parse_origins(
                lookup("CORS_ALLOW_ORIGINS").as_deref().unwrap_or("*"),
            ),
            bind_addr,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            model_root: self.model_root.clone(),
            model_name: self.model_name.clone(),
            ctx_id: self.ctx_id,
            det_size: self.det_size,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_size_mb.saturating_mul(1024 * 1024)
    }

    /// `true` when any origin may call the API.
    pub fn allows_any_origin(&self) -> bool {
        self.cors_allow_origins.iter().any(|o| o == "*")
    }
}

fn at_least(value: Option<i64>, default: i64, min: i64) -> i64 {
    value.unwrap_or(default).max(min)
}

fn parse_origins(raw: &str) -> Vec<String> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();
    if origins.is_empty() {
        vec!["*".to_string()]
    } else {
        origins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("HOME", "/home/matchu")]).unwrap();
        assert_eq!(config.app_name, "MatchU Verification Backend");
        assert_eq!(config.similarity_threshold, 0.65);
        assert_eq!(config.max_upload_size_mb, 10);
        assert_eq!(config.max_upload_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.model_name, "buffalo_l");
        assert_eq!(config.ctx_id, -1);
        assert_eq!(config.det_size, 640);
        assert_eq!(config.model_root, PathBuf::from("/home/matchu/.insightface/models"));
        assert_eq!(config.retry_interval, Duration::from_secs(15));
        assert_eq!(config.cors_allow_origins, vec!["*"]);
        assert!(config.allows_any_origin());
        assert_eq!(config.bind_addr, "0.0.0.0:8000".parse().unwrap());
    }

    #[test]
    fn test_numeric_clamping() {
        let config = load(&[
            ("SIMILARITY_THRESHOLD", "1.7"),
            ("MAX_UPLOAD_SIZE_MB", "0"),
            ("INSIGHTFACE_DET_SIZE", "32"),
            ("ENGINE_RETRY_INTERVAL_SECS", "-4"),
        ])
        .unwrap();
        assert_eq!(config.similarity_threshold, 1.0);
        assert_eq!(config.max_upload_size_mb, 1);
        assert_eq!(config.det_size, 64);
        assert_eq!(config.retry_interval, Duration::from_secs(1));

        let config = load(&[("SIMILARITY_THRESHOLD", "-0.2")]).unwrap();
        assert_eq!(config.similarity_threshold, 0.0);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = load(&[
            ("SIMILARITY_THRESHOLD", "high"),
            ("MAX_UPLOAD_SIZE_MB", "ten"),
            ("INSIGHTFACE_CTX_ID", "gpu0"),
        ])
        .unwrap();
        assert_eq!(config.similarity_threshold, 0.65);
        assert_eq!(config.max_upload_size_mb, 10);
        assert_eq!(config.ctx_id, -1);
    }

    #[test]
    fn test_cors_origins() {
        let config =
            load(&[("CORS_ALLOW_ORIGINS", " https://a.example , ,https://b.example")]).unwrap();
        assert_eq!(config.cors_allow_origins, vec!["https://a.example", "https://b.example"]);
        assert!(!config.allows_any_origin());

        let config = load(&[("CORS_ALLOW_ORIGINS", " , ")]).unwrap();
        assert_eq!(config.cors_allow_origins, vec!["*"]);
    }

    #[test]
    fn test_engine_settings() {
        let config = load(&[
            ("INSIGHTFACE_MODEL_ROOT", "/srv/models"),
            ("INSIGHTFACE_MODEL_NAME", "antelopev2"),
            ("INSIGHTFACE_CTX_ID", "0"),
        ])
        .unwrap();
        let settings = config.engine_settings();
        assert_eq!(settings.model_dir(), PathBuf::from("/srv/models/antelopev2"));
        assert_eq!(settings.ctx_id, 0);
    }

    #[test]
    fn test_invalid_bind_addr() {
        let err = load(&[("BIND_ADDR", "localhost")]).unwrap_err();
        assert!(err.to_string().contains("localhost"));
    }
}
