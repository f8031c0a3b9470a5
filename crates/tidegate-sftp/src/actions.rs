//! Action hook notifications.
//!
//! When an operation in the configured `execute_on` list completes, a
//! JSON record is POSTed to an HTTP hook or handed to a local program
//! via argv and `TIDEGATE_ACTION_*` environment variables. Hook failures
//! are logged and ignored, except for `pre-delete` which blocks the
//! delete when the hook fails.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use tidegate_core::User;

pub const OPERATION_DOWNLOAD: &str = "download";
pub const OPERATION_UPLOAD: &str = "upload";
pub const OPERATION_DELETE: &str = "delete";
pub const OPERATION_PRE_DELETE: &str = "pre-delete";
pub const OPERATION_RENAME: &str = "rename";
pub const OPERATION_SSH_CMD: &str = "ssh_cmd";

/// Timeout for hook execution, both HTTP and subprocess
const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Hook configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Operations the hook fires for; empty disables notifications
    #[serde(default)]
    pub execute_on: Vec<String>,
    /// Absolute path to a program, or an HTTP(S) URL
    #[serde(default)]
    pub hook: String,
}

/// The JSON record delivered to hooks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionNotification {
    pub action: String,
    pub username: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_cmd: Option<String>,
    pub file_size: i64,
    pub fs_provider: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// 0 failed, 1 ok, 2 quota exceeded
    pub status: u8,
}

impl ActionNotification {
    pub fn new(
        user: &User,
        operation: &str,
        path: &str,
        target_path: Option<&str>,
        ssh_cmd: Option<&str>,
        file_size: i64,
        err: Option<&Error>,
    ) -> Self {
        Self {
            action: operation.to_string(),
            username: user.username.clone(),
            path: path.to_string(),
            target_path: target_path.map(str::to_string),
            ssh_cmd: ssh_cmd.map(str::to_string),
            file_size,
            fs_provider: user.fs_config.provider.as_code(),
            bucket: user.fs_config.bucket.clone(),
            endpoint: user.fs_config.endpoint.clone(),
            status: Error::notification_status(err),
        }
    }

    /// Environment passed to program hooks
    pub fn as_env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("TIDEGATE_ACTION".to_string(), self.action.clone()),
            ("TIDEGATE_ACTION_USERNAME".to_string(), self.username.clone()),
            ("TIDEGATE_ACTION_PATH".to_string(), self.path.clone()),
            (
                "TIDEGATE_ACTION_TARGET".to_string(),
                self.target_path.clone().unwrap_or_default(),
            ),
            (
                "TIDEGATE_ACTION_SSH_CMD".to_string(),
                self.ssh_cmd.clone().unwrap_or_default(),
            ),
            (
                "TIDEGATE_ACTION_FILE_SIZE".to_string(),
                self.file_size.to_string(),
            ),
            (
                "TIDEGATE_ACTION_FS_PROVIDER".to_string(),
                self.fs_provider.to_string(),
            ),
            (
                "TIDEGATE_ACTION_BUCKET".to_string(),
                self.bucket.clone().unwrap_or_default(),
            ),
            (
                "TIDEGATE_ACTION_ENDPOINT".to_string(),
                self.endpoint.clone().unwrap_or_default(),
            ),
            ("TIDEGATE_ACTION_STATUS".to_string(), self.status.to_string()),
        ]
    }
}

/// Fire the hook for a notification if its operation is configured.
///
/// Errors are returned so `pre-delete` can block; for every other
/// operation the caller ignores the result.
pub async fn execute_action(config: &ActionsConfig, notification: ActionNotification) -> Result<()> {
    if !config.execute_on.iter().any(|op| op == &notification.action) {
        return Err(Error::Generic("no hook configured for this action".to_string()));
    }
    if config.hook.is_empty() {
        warn!(action = %notification.action, "action configured but no hook defined");
        return Err(Error::Config("no hook defined".to_string()));
    }
    if config.hook.starts_with("http") {
        execute_http_hook(&config.hook, &notification).await
    } else {
        execute_program_hook(&config.hook, &notification).await
    }
}

async fn execute_http_hook(url: &str, notification: &ActionNotification) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(HOOK_TIMEOUT)
        .build()
        .map_err(|e| Error::Generic(format!("hook client: {}", e)))?;
    let response = client
        .post(url)
        .json(notification)
        .send()
        .await
        .map_err(|e| Error::Connection(format!("hook POST failed: {}", e)))?;
    let status = response.status();
    debug!(action = %notification.action, url, %status, "action notified over HTTP");
    if !status.is_success() {
        return Err(Error::Generic(format!(
            "unexpected hook response code: {}",
            status
        )));
    }
    Ok(())
}

async fn execute_program_hook(hook: &str, notification: &ActionNotification) -> Result<()> {
    if !Path::new(hook).is_absolute() {
        warn!(hook, "notification program must be an absolute path");
        return Err(Error::Config(format!("invalid notification command {}", hook)));
    }
    let mut command = Command::new(hook);
    command
        .arg(&notification.action)
        .arg(&notification.username)
        .arg(&notification.path)
        .arg(notification.target_path.as_deref().unwrap_or(""))
        .arg(notification.ssh_cmd.as_deref().unwrap_or(""))
        .kill_on_drop(true);
    for (key, value) in notification.as_env_vars() {
        command.env(key, value);
    }
    let status = tokio::time::timeout(HOOK_TIMEOUT, async {
        command
            .status()
            .await
            .map_err(|e| Error::Generic(format!("hook exec failed: {}", e)))
    })
    .await
    .map_err(|_| Error::Generic("hook timed out".to_string()))??;
    debug!(action = %notification.action, hook, code = ?status.code(), "action hook executed");
    if !status.success() {
        return Err(Error::Generic(format!(
            "hook exited with status {:?}",
            status.code()
        )));
    }
    Ok(())
}

/// Run the pre-delete hook. Returns true when the hook handled the
/// delete (the caller replies Ok without re-issuing it), false when no
/// hook applies; an error means the delete must be refused.
pub async fn execute_pre_delete_action(
    config: &ActionsConfig,
    user: &User,
    virtual_path: &str,
    file_size: i64,
) -> Result<bool> {
    if !config.execute_on.iter().any(|op| op == OPERATION_PRE_DELETE) {
        return Ok(false);
    }
    if config.hook.is_empty() {
        return Ok(false);
    }
    let notification = ActionNotification::new(
        user,
        OPERATION_PRE_DELETE,
        virtual_path,
        None,
        None,
        file_size,
        None,
    );
    match execute_action(config, notification).await {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!(path = virtual_path, error = %e, "pre-delete hook failed, delete refused");
            Err(Error::PermissionDenied(format!(
                "pre-delete hook rejected {}",
                virtual_path
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tidegate_core::{FsProvider, Permission};

    fn test_user() -> User {
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        let mut user = User {
            username: "hookuser".to_string(),
            home_dir: PathBuf::from("/srv/hookuser"),
            status: Default::default(),
            expiration_date: 0,
            permissions,
            filters: Default::default(),
            quota_files: 0,
            quota_size: 0,
            max_sessions: 0,
            used_quota_files: 0,
            used_quota_size: 0,
            last_login: None,
            fs_config: Default::default(),
            virtual_folders: Vec::new(),
        };
        user.fs_config.provider = FsProvider::S3;
        user.fs_config.bucket = Some("backups".to_string());
        user.fs_config.endpoint = Some("https://s3.example.com".to_string());
        user
    }

    #[test]
    fn test_notification_fields() {
        let user = test_user();
        let n = ActionNotification::new(
            &user,
            OPERATION_UPLOAD,
            "/in/file.bin",
            None,
            None,
            123,
            None,
        );
        assert_eq!(n.status, 1);
        assert_eq!(n.fs_provider, 1);
        assert_eq!(n.bucket.as_deref(), Some("backups"));

        let n = ActionNotification::new(
            &user,
            OPERATION_UPLOAD,
            "/in/file.bin",
            None,
            None,
            123,
            Some(&Error::QuotaExceeded("size".into())),
        );
        assert_eq!(n.status, 2);

        let n = ActionNotification::new(
            &user,
            OPERATION_RENAME,
            "/a",
            Some("/b"),
            None,
            0,
            Some(&Error::Generic("x".into())),
        );
        assert_eq!(n.status, 0);
        assert_eq!(n.target_path.as_deref(), Some("/b"));
    }

    #[test]
    fn test_env_vars_carry_prefix() {
        let user = test_user();
        let n = ActionNotification::new(&user, OPERATION_SSH_CMD, "/x", None, Some("md5sum"), 0, None);
        let envs = n.as_env_vars();
        assert!(envs.iter().all(|(k, _)| k.starts_with("TIDEGATE_ACTION")));
        assert!(envs
            .iter()
            .any(|(k, v)| k == "TIDEGATE_ACTION_SSH_CMD" && v == "md5sum"));
    }

    #[tokio::test]
    async fn test_unconfigured_action_is_skipped() {
        let config = ActionsConfig::default();
        let user = test_user();
        let n = ActionNotification::new(&user, OPERATION_UPLOAD, "/x", None, None, 0, None);
        assert!(execute_action(&config, n).await.is_err());
    }

    #[tokio::test]
    async fn test_relative_program_hook_is_rejected() {
        let config = ActionsConfig {
            execute_on: vec![OPERATION_UPLOAD.to_string()],
            hook: "relative/hook.sh".to_string(),
        };
        let user = test_user();
        let n = ActionNotification::new(&user, OPERATION_UPLOAD, "/x", None, None, 0, None);
        assert!(execute_action(&config, n).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_hook_runs() {
        let config = ActionsConfig {
            execute_on: vec![OPERATION_PRE_DELETE.to_string()],
            hook: "/bin/sh".to_string(),
        };
        let user = test_user();
        // /bin/sh <action> ... exits 127 for an unknown command name, which
        // counts as a hook failure and blocks the delete
        let handled = execute_pre_delete_action(&config, &user, "/doomed.txt", 10).await;
        assert!(handled.is_err());
    }

    #[tokio::test]
    async fn test_pre_delete_without_hook_is_noop() {
        let config = ActionsConfig {
            execute_on: vec![OPERATION_PRE_DELETE.to_string()],
            hook: String::new(),
        };
        let user = test_user();
        let handled = execute_pre_delete_action(&config, &user, "/doomed.txt", 10)
            .await
            .unwrap();
        assert!(!handled);
    }
}
