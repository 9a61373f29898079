//! Daemon configuration.
//!
//! Stored as TOML at `$CHUNKFERRY_CONFIG`, or `~/.config/chunkferry/server.toml`
//! when unset. A file with defaults is written on first start.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chunkferry_protocol::constants::DEFAULT_CHUNK_SIZE;
use chunkferry_server::{DEFAULT_MAX_FILE_SIZE, DEFAULT_PORT, ReaperConfig, ServerConfig, ServiceConfig};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "CHUNKFERRY_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// Directory holding one backing file per session.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// SQLite database with session and chunk state.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Chunk size in bytes for new sessions.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Largest file accepted for upload, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_stale_ttl_hours")]
    pub stale_ttl_hours: u64,

    #[serde(default = "default_processing_ttl_hours")]
    pub processing_ttl_hours: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("chunkferry")
}

fn default_upload_dir() -> PathBuf {
    data_dir().join("uploads")
}

fn default_database_path() -> PathBuf {
    data_dir().join("sessions.db")
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_stale_ttl_hours() -> u64 {
    24
}

fn default_processing_ttl_hours() -> u64 {
    72
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            upload_dir: default_upload_dir(),
            database_path: default_database_path(),
            chunk_size: default_chunk_size(),
            max_file_size: default_max_file_size(),
            stale_ttl_hours: default_stale_ttl_hours(),
            processing_ttl_hours: default_processing_ttl_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or writes and returns the defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(
            self.chunk_size < chunkferry_protocol::constants::WS_MAX_MESSAGE_SIZE as u64,
            "chunk_size must be below the WebSocket message limit"
        );
        Ok(())
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            port: self.port,
        }
    }

    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            upload_dir: self.upload_dir.clone(),
            chunk_size: self.chunk_size,
            max_file_size: self.max_file_size,
        }
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            stale_ttl: Duration::from_secs(self.stale_ttl_hours * 60 * 60),
            processing_ttl: Duration::from_secs(self.processing_ttl_hours * 60 * 60),
            interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("chunkferry")
        .join("server.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.port, 4000);
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.service().max_file_size, 64 * 1024 * 1024 * 1024);
        assert_eq!(config.reaper().stale_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(config.reaper().processing_ttl, Duration::from_secs(72 * 3600));
        assert_eq!(config.reaper().interval, Duration::from_secs(3600));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
port = 9000
bind = "127.0.0.1"
upload_dir = "/srv/uploads"
"#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.upload_dir, PathBuf::from("/srv/uploads"));
        assert_eq!(config.stale_ttl_hours, 24);
        assert_eq!(config.server().port, 9000);
        assert_eq!(config.service().upload_dir, PathBuf::from("/srv/uploads"));
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("server.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.toml");
        std::fs::write(&path, "chunk_size = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
