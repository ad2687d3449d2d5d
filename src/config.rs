//! Runtime settings
//!
//! Loaded from a JSON file, with every field defaulted, then overridden from
//! `DTEE_*` environment variables.

use crate::codec::ByteOrder;
use crate::network::MAX_TRANSFER_SIZE;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// Call transport tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Polls (and result waits) before a call gives up
    pub retry_count: u32,
    pub retry_interval_ms: u64,
    /// How long a server waits for a router on the detection topics
    pub detect_timeout_ms: u64,
    pub max_transfer_size: usize,
    /// Byte order of call arguments and replies
    pub byte_order: ByteOrder,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            retry_count: 30,
            retry_interval_ms: 100,
            detect_timeout_ms: 1000,
            max_transfer_size: MAX_TRANSFER_SIZE,
            byte_order: ByteOrder::Little,
        }
    }
}

impl TransportSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Total wait budget of one call step
    pub fn call_budget(&self) -> Duration {
        self.retry_interval() * self.retry_count.max(1)
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms)
    }
}

/// Enclave hosting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeeSettings {
    /// Directory holding `<name>.signed.so` images
    pub enclave_dir: PathBuf,
    /// Enclave version mapping file, relative to `enclave_dir` unless absolute
    pub mapping_file: PathBuf,
    /// Force the local TEE probe result
    pub local_tee: Option<bool>,
    /// Kernel module whose presence means a local TEE
    pub tee_module: String,
}

impl Default for TeeSettings {
    fn default() -> Self {
        Self {
            enclave_dir: PathBuf::from("."),
            mapping_file: PathBuf::from("mapping"),
            local_tee: None,
            tee_module: "penglai".to_string(),
        }
    }
}

impl TeeSettings {
    pub fn mapping_path(&self) -> PathBuf {
        if self.mapping_file.is_absolute() {
            self.mapping_file.clone()
        } else {
            self.enclave_dir.join(&self.mapping_file)
        }
    }
}

/// libp2p swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Port to listen on (0 = random)
    pub listen_port: u16,
    /// Gossipsub heartbeat interval
    pub heartbeat_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_port: 0,
            heartbeat_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transport: TransportSettings,
    pub tee: TeeSettings,
    pub network: NetworkSettings,
}

impl Settings {
    /// Read settings from a JSON file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)?;
        let settings = serde_json::from_str(&json)?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Apply `DTEE_*` overrides from the process environment
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = var("DTEE_RETRY_COUNT") {
            self.transport.retry_count = parse_var("DTEE_RETRY_COUNT", &value)?;
        }
        if let Some(value) = var("DTEE_RETRY_INTERVAL_MS") {
            self.transport.retry_interval_ms = parse_var("DTEE_RETRY_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("DTEE_ENCLAVE_DIR") {
            self.tee.enclave_dir = PathBuf::from(value);
        }
        if let Some(value) = var("DTEE_LOCAL_TEE") {
            self.tee.local_tee = Some(parse_var("DTEE_LOCAL_TEE", &value)?);
        }
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.transport.retry_count, 30);
        assert_eq!(settings.transport.retry_interval(), Duration::from_millis(100));
        assert_eq!(settings.transport.max_transfer_size, 200_000);
        assert_eq!(settings.tee.tee_module, "penglai");
        assert_eq!(settings.tee.mapping_path(), PathBuf::from("./mapping"));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dtee.json");
        std::fs::write(
            &path,
            r#"{ "transport": { "retry_count": 5, "byte_order": "big" }, "tee": { "local_tee": true } }"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.transport.retry_count, 5);
        assert_eq!(settings.transport.retry_interval_ms, 100);
        assert_eq!(settings.transport.byte_order, ByteOrder::Big);
        assert_eq!(settings.tee.local_tee, Some(true));
        assert_eq!(settings.network.heartbeat_secs, 1);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dtee.json");
        let mut settings = Settings::default();
        settings.network.listen_port = 4100;
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DTEE_RETRY_COUNT", "3"),
            ("DTEE_ENCLAVE_DIR", "/opt/enclaves"),
            ("DTEE_LOCAL_TEE", "false"),
        ]
        .into_iter()
        .collect();
        let settings = Settings::default()
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.transport.retry_count, 3);
        assert_eq!(settings.tee.enclave_dir, PathBuf::from("/opt/enclaves"));
        assert_eq!(settings.tee.local_tee, Some(false));
    }

    #[test]
    fn test_bad_env_value() {
        let err = Settings::default()
            .apply_vars(|key| (key == "DTEE_RETRY_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
