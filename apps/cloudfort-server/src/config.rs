//! Configuration management for the CloudFort server
//!
//! Settings live in a JSON file that is created with defaults on first run.
//! A few values can be overridden from the environment (a `.env` file is
//! honored by the binary).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default config file name, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "server-config.json";

/// Longest lease or download window accepted, one year
pub const MAX_LEASE_MINUTES: u64 = 365 * 24 * 60;

/// Largest world archive accepted, 1 TiB
pub const MAX_WORLD_SIZE_MB: u64 = 1024 * 1024;

/// Longest sweep period or socket timeout accepted, one day
pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub world_save_folder: PathBuf,
    pub temp_folder: PathBuf,
    pub host_bind_address: String,
    pub port_number: u16,
    pub check_out_time_limit_minutes: u64,
    pub download_time_limit_minutes: u64,
    pub world_size_limit_mb: u64,
    pub server_overseer_name: String,
    pub expiry_check_interval_secs: u64,
    pub io_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            world_save_folder: PathBuf::from("save"),
            temp_folder: PathBuf::from("temp"),
            host_bind_address: "0.0.0.0".to_string(),
            port_number: 13137,
            check_out_time_limit_minutes: 8 * 60,
            download_time_limit_minutes: 30,
            world_size_limit_mb: 256,
            server_overseer_name: "<Server>".to_string(),
            expiry_check_interval_secs: 1,
            io_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Read the config file, or write the defaults to it if it is missing
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };

        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file does not exist, creating a new one");
            let config = Config::default();
            let json = serde_json::to_string_pretty(&config)?;
            std::fs::write(path, json).map_err(io_err)?;
            return Ok(config);
        }

        let json = std::fs::read_to_string(path).map_err(io_err)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Apply `CLOUDFORT_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(bind) = env::var("CLOUDFORT_BIND") {
            self.host_bind_address = bind;
        }
        if let Ok(port) = env::var("CLOUDFORT_PORT") {
            self.port_number = port.parse().map_err(|_| ConfigError::Invalid {
                field: "CLOUDFORT_PORT",
                reason: format!("'{}' is not a port number", port),
            })?;
        }
        if let Ok(dir) = env::var("CLOUDFORT_SAVE_DIR") {
            self.world_save_folder = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("CLOUDFORT_TEMP_DIR") {
            self.temp_folder = PathBuf::from(dir);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounded = [
            ("checkOutTimeLimitMinutes", self.check_out_time_limit_minutes, MAX_LEASE_MINUTES),
            ("downloadTimeLimitMinutes", self.download_time_limit_minutes, MAX_LEASE_MINUTES),
            ("worldSizeLimitMb", self.world_size_limit_mb, MAX_WORLD_SIZE_MB),
            ("expiryCheckIntervalSecs", self.expiry_check_interval_secs, MAX_INTERVAL_SECS),
            ("ioTimeoutSecs", self.io_timeout_secs, MAX_INTERVAL_SECS),
        ];
        for (field, value, max) in bounded {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            if value > max {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("must be at most {}", max),
                });
            }
        }
        if self.server_overseer_name.contains(':') || self.server_overseer_name.contains('\n') {
            return Err(ConfigError::Invalid {
                field: "serverOverseerName",
                reason: "must not contain ':' or a newline".to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host_bind_address, self.port_number)
    }

    // The derived values clamp to the validated ranges so an unvalidated
    // config cannot overflow them.

    pub fn check_out_time_limit(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.check_out_time_limit_minutes.min(MAX_LEASE_MINUTES) as i64)
    }

    pub fn download_time_limit(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.download_time_limit_minutes.min(MAX_LEASE_MINUTES) as i64)
    }

    /// Wall-clock budget for one archive transfer
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.download_time_limit_minutes.min(MAX_LEASE_MINUTES) * 60)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval_secs)
    }

    pub fn world_size_limit_bytes(&self) -> u64 {
        self.world_size_limit_mb.saturating_mul(1024 * 1024)
    }
}
