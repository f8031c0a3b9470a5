//! Configuration for the SFTP/SCP server

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::actions::ActionsConfig;
use crate::error::{Error, Result};
use crate::ssh_command::SUPPORTED_SSH_COMMANDS;

/// How uploads reach their final path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Write directly to the requested path; a failed upload may leave a
    /// partial file behind
    Standard,
    /// Write to a staging path, rename over the target on success, delete
    /// the staging file on failure
    Atomic,
    /// Like atomic, but a failed upload renames the staging file onto the
    /// target so the client can resume from the received bytes
    AtomicResume,
}

impl Default for UploadMode {
    fn default() -> Self {
        UploadMode::Standard
    }
}

/// Handling of SETSTAT/FSETSTAT requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetstatMode {
    /// Apply chmod/chown/chtimes requests
    Normal,
    /// Silently acknowledge them without touching the filesystem
    Ignore,
}

impl Default for SetstatMode {
    fn default() -> Self {
        SetstatMode::Normal
    }
}

/// SFTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpdConfig {
    /// Identification string, sent as `SSH-2.0-<banner>`
    #[serde(default = "default_banner")]
    pub banner: String,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Idle timeout in minutes, 0 disables the idle sweeper
    #[serde(default)]
    pub idle_timeout: u64,

    /// Maximum authentication attempts per connection
    #[serde(default = "default_max_auth_tries")]
    pub max_auth_tries: u32,

    #[serde(default)]
    pub upload_mode: UploadMode,

    #[serde(default)]
    pub setstat_mode: SetstatMode,

    /// Private host key paths, absolute or relative to the config
    /// directory. Empty means use or generate the default keys.
    #[serde(default)]
    pub host_keys: Vec<PathBuf>,

    /// Public keys of CAs trusted to sign user certificates
    #[serde(default)]
    pub trusted_user_ca_keys: Vec<PathBuf>,

    /// File whose contents are sent to the client before authentication
    #[serde(default)]
    pub login_banner_file: Option<PathBuf>,

    /// Enabled SSH commands; `*` enables every supported command
    #[serde(default = "default_ssh_commands")]
    pub enabled_ssh_commands: Vec<String>,

    /// External keyboard-interactive authentication hook: an absolute
    /// program path or an HTTP endpoint. Empty disables the method.
    #[serde(default)]
    pub keyboard_interactive_auth_hook: Option<String>,

    /// PROXY protocol support: 0 disabled, 1 enabled, 2 required
    #[serde(default)]
    pub proxy_protocol: u8,

    /// Sources allowed to send the proxy header
    #[serde(default)]
    pub proxy_allowed: Vec<String>,

    /// Hooks fired on transfer events
    #[serde(default)]
    pub actions: ActionsConfig,
}

impl Default for SftpdConfig {
    fn default() -> Self {
        Self {
            banner: default_banner(),
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            idle_timeout: 0,
            max_auth_tries: default_max_auth_tries(),
            upload_mode: UploadMode::default(),
            setstat_mode: SetstatMode::default(),
            host_keys: Vec::new(),
            trusted_user_ca_keys: Vec::new(),
            login_banner_file: None,
            enabled_ssh_commands: default_ssh_commands(),
            keyboard_interactive_auth_hook: None,
            proxy_protocol: 0,
            proxy_allowed: Vec::new(),
            actions: ActionsConfig::default(),
        }
    }
}

impl SftpdConfig {
    /// The enabled command list with `*` expanded and unsupported names
    /// dropped
    pub fn effective_ssh_commands(&self) -> Vec<String> {
        if self.enabled_ssh_commands.iter().any(|c| c == "*") {
            return SUPPORTED_SSH_COMMANDS.iter().map(|c| c.to_string()).collect();
        }
        self.enabled_ssh_commands
            .iter()
            .filter(|c| {
                let ok = SUPPORTED_SSH_COMMANDS.contains(&c.as_str());
                if !ok {
                    tracing::warn!(command = %c, "unsupported ssh command ignored");
                }
                ok
            })
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.banner.is_empty() {
            return Err(Error::Config("banner must not be empty".to_string()));
        }
        if self.proxy_protocol > 2 {
            return Err(Error::Config(format!(
                "invalid proxy_protocol {}, valid values are 0, 1, 2",
                self.proxy_protocol
            )));
        }
        if let Some(hook) = &self.keyboard_interactive_auth_hook {
            if !hook.starts_with("http") && !PathBuf::from(hook).is_absolute() {
                return Err(Error::Config(format!(
                    "keyboard interactive hook {} must be an HTTP endpoint or an absolute path",
                    hook
                )));
            }
        }
        Ok(())
    }
}

fn default_banner() -> String {
    "Tidegate".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    2022
}

fn default_max_auth_tries() -> u32 {
    6
}

fn default_ssh_commands() -> Vec<String> {
    ["md5sum", "sha1sum", "cd", "pwd", "scp"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}
