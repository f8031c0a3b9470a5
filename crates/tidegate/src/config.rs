//! Process-level configuration: the sftpd section, the control plane
//! section and the data provider section, loaded from one TOML file in
//! the configuration directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tidegate_core::QuotaTracking;
use tidegate_sftp::SftpdConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub sftpd: SftpdConfig,

    #[serde(default)]
    pub httpd: HttpdConfig,

    #[serde(default)]
    pub data_provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpdConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_http_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_http_bind_port")]
    pub bind_port: u16,
}

impl Default for HttpdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_http_bind_address(),
            bind_port: default_http_bind_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// JSON dump file backing the reference provider, relative to the
    /// configuration directory unless absolute
    #[serde(default = "default_dump_file")]
    pub dump_file: PathBuf,

    /// 0 off, 1 full, 2 restrictions-only
    #[serde(default = "default_track_quota")]
    pub track_quota: u8,

    /// Seconds between delayed quota flushes, 0 writes through
    #[serde(default)]
    pub delayed_quota_update: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            dump_file: default_dump_file(),
            track_quota: default_track_quota(),
            delayed_quota_update: 0,
        }
    }
}

impl ProviderConfig {
    pub fn tracking(&self) -> QuotaTracking {
        match self.track_quota {
            0 => QuotaTracking::Off,
            2 => QuotaTracking::RestrictionsOnly,
            _ => QuotaTracking::Full,
        }
    }

    pub fn dump_path(&self, config_dir: &Path) -> PathBuf {
        if self.dump_file.is_absolute() {
            self.dump_file.clone()
        } else {
            config_dir.join(&self.dump_file)
        }
    }
}

impl GlobalConfig {
    /// Load `<config_dir>/<config_name>`, falling back to the defaults
    /// when the file does not exist
    pub fn load(config_dir: &Path, config_name: &str) -> Result<Self> {
        let path = config_dir.join(config_name);
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .context(format!("failed to read {}", path.display()))?;
        toml::from_str(&content).context(format!("failed to parse {}", path.display()))
    }
}

fn default_http_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_bind_port() -> u16 {
    8090
}

fn default_dump_file() -> PathBuf {
    PathBuf::from("provider.json")
}

fn default_track_quota() -> u8 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GlobalConfig::default();
        assert!(config.httpd.enabled);
        assert_eq!(config.httpd.bind_port, 8090);
        assert_eq!(config.data_provider.tracking(), QuotaTracking::Full);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GlobalConfig::load(dir.path(), "missing.toml").unwrap();
        assert_eq!(config.sftpd.bind_port, 2022);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tidegate.toml"), "sftpd = nonsense").unwrap();
        assert!(GlobalConfig::load(dir.path(), "tidegate.toml").is_err());
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tidegate.toml"),
            r#"
[sftpd]
bind_port = 2222
upload_mode = "atomic"

[httpd]
enabled = false

[data_provider]
track_quota = 2
delayed_quota_update = 120
"#,
        )
        .unwrap();
        let config = GlobalConfig::load(dir.path(), "tidegate.toml").unwrap();
        assert_eq!(config.sftpd.bind_port, 2222);
        assert!(!config.httpd.enabled);
        assert_eq!(
            config.data_provider.tracking(),
            QuotaTracking::RestrictionsOnly
        );
        assert_eq!(config.data_provider.delayed_quota_update, 120);
    }

    #[test]
    fn test_dump_path_resolution() {
        let provider = ProviderConfig::default();
        assert_eq!(
            provider.dump_path(Path::new("/etc/tidegate")),
            PathBuf::from("/etc/tidegate/provider.json")
        );
        let provider = ProviderConfig {
            dump_file: PathBuf::from("/var/lib/tidegate/users.json"),
            ..Default::default()
        };
        assert_eq!(
            provider.dump_path(Path::new("/etc/tidegate")),
            PathBuf::from("/var/lib/tidegate/users.json")
        );
    }
}
