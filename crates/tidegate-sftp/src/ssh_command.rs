//! Allow-listed SSH exec commands.
//!
//! Besides `scp` (handled by the dedicated engine) the server executes a
//! small closed set of commands: message digests computed in-process,
//! `cd`/`pwd` stubs for clients that probe their start directory, the
//! git pack commands and rsync forwarded to system binaries, and the
//! internal recursive copy/remove pair with per-entry permission checks.

use md5::Md5;
use russh::server::Handle;
use russh::ChannelId;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::actions::{self, ActionNotification, ActionsConfig, OPERATION_SSH_CMD};
use crate::error::{Error, Result};
use crate::handler::{ChannelInput, upload_quota_check};
use crate::registry::ConnectionRegistry;
use crate::session::ServerSession;
use crate::vfs;
use tidegate_core::{clean_virtual_path, FsProvider, Permission, QuotaTracking};
use tidegate_provider::DataProvider;

/// Every command the server knows how to execute
pub const SUPPORTED_SSH_COMMANDS: &[&str] = &[
    "scp",
    "md5sum",
    "sha1sum",
    "sha256sum",
    "sha384sum",
    "sha512sum",
    "cd",
    "pwd",
    "git-receive-pack",
    "git-upload-pack",
    "git-upload-archive",
    "rsync",
    "tidegate-copy",
    "tidegate-remove",
];

const HASH_COMMANDS: &[&str] = &["md5sum", "sha1sum", "sha256sum", "sha384sum", "sha512sum"];
const SYSTEM_COMMANDS: &[&str] = &["git-receive-pack", "git-upload-pack", "git-upload-archive", "rsync"];

const HASH_CHUNK: usize = 32 * 1024;

/// A parsed exec request payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCommand {
    pub command: String,
    pub args: Vec<String>,
}

/// Split an exec payload into command and arguments. Double and single
/// quotes group words; a backslash escapes the following space.
pub fn parse_command_payload(payload: &str) -> Result<SshCommand> {
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in payload.trim().chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' | '\'' => match quote {
                Some(q) if q == c => quote = None,
                Some(_) => current.push(c),
                None => quote = Some(c),
            },
            ' ' if quote.is_none() => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    if quote.is_some() {
        return Err(Error::Protocol("unterminated quote in command".to_string()));
    }
    let mut iter = parts.into_iter();
    let command = iter
        .next()
        .ok_or_else(|| Error::Protocol("empty command".to_string()))?;
    Ok(SshCommand {
        command,
        args: iter.collect(),
    })
}

pub struct SshCommandEngine {
    session: Arc<ServerSession>,
    registry: Arc<ConnectionRegistry>,
    provider: Arc<dyn DataProvider>,
    actions: ActionsConfig,
    handle: Handle,
    channel: ChannelId,
    cmd: SshCommand,
}

impl SshCommandEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<ServerSession>,
        registry: Arc<ConnectionRegistry>,
        provider: Arc<dyn DataProvider>,
        actions: ActionsConfig,
        handle: Handle,
        channel: ChannelId,
        cmd: SshCommand,
    ) -> Self {
        Self {
            session,
            registry,
            provider,
            actions,
            handle,
            channel,
            cmd,
        }
    }

    pub async fn run(self, rx: mpsc::Receiver<ChannelInput>) {
        let command = self.cmd.command.clone();
        let result = self.dispatch(rx).await;
        let exit_status = match &result {
            Ok(code) => *code,
            Err(e) => {
                warn!(
                    connection_id = %self.session.id(),
                    command = %command,
                    error = %e,
                    "ssh command failed"
                );
                let msg = format!("{}\n", e.sanitized_message());
                let _ = self
                    .handle
                    .extended_data(self.channel, 1, russh::CryptoVec::from_slice(msg.as_bytes()))
                    .await;
                1
            }
        };
        self.notify_ssh_cmd(&command, result.as_ref().err()).await;
        let _ = self.handle.exit_status_request(self.channel, exit_status).await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
        debug!(connection_id = %self.session.id(), command = %command, exit_status, "ssh command finished");
    }

    async fn dispatch(&self, rx: mpsc::Receiver<ChannelInput>) -> Result<u32> {
        match self.cmd.command.as_str() {
            cmd if HASH_COMMANDS.contains(&cmd) => self.run_hash(rx).await,
            "cd" => Ok(0),
            "pwd" => {
                self.send(b"/\n").await?;
                Ok(0)
            }
            cmd if SYSTEM_COMMANDS.contains(&cmd) => self.run_system_command(rx).await,
            "tidegate-copy" => self.run_copy().await,
            "tidegate-remove" => self.run_remove().await,
            other => Err(Error::OpUnsupported(format!("command {}", other))),
        }
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel, russh::CryptoVec::from_slice(data))
            .await
            .map_err(|_| Error::Connection("channel write failed".to_string()))
    }

    fn first_path_arg(&self) -> Option<String> {
        self.cmd
            .args
            .iter()
            .rev()
            .find(|a| !a.starts_with('-'))
            .map(|a| clean_virtual_path(a))
    }

    // ----- digests -----

    async fn run_hash(&self, mut rx: mpsc::Receiver<ChannelInput>) -> Result<u32> {
        let line = match self.first_path_arg() {
            Some(vpath) => {
                let user = self.session.user();
                if !user.has_perms(&[Permission::List, Permission::Download], &vpath) {
                    return Err(Error::PermissionDenied(vpath));
                }
                if !user.is_file_allowed(&vpath) {
                    return Err(Error::PermissionDenied(vpath));
                }
                let digest = self.hash_file(&vpath).await?;
                format!("{}  {}\n", digest, vpath)
            }
            None => {
                // no path: digest the data piped through the channel
                let mut hasher = MultiHasher::new(&self.cmd.command)?;
                while let Some(input) = rx.recv().await {
                    match input {
                        ChannelInput::Data(data) => hasher.update(&data),
                        ChannelInput::Eof => break,
                    }
                }
                format!("{}  -\n", hasher.finish())
            }
        };
        self.send(line.as_bytes()).await?;
        Ok(0)
    }

    async fn hash_file(&self, vpath: &str) -> Result<String> {
        let mut file = self.session.fs().open_read(vpath).await?;
        let mut hasher = MultiHasher::new(&self.cmd.command)?;
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let n = file.read(&mut buf).await.map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }

    // ----- git / rsync passthrough -----

    async fn run_system_command(&self, mut rx: mpsc::Receiver<ChannelInput>) -> Result<u32> {
        let user = self.session.user();
        if user.fs_config.provider != FsProvider::Local {
            return Err(Error::OpUnsupported("unsupported configuration".to_string()));
        }
        let vpath = self
            .first_path_arg()
            .ok_or_else(|| Error::Protocol("missing path argument".to_string()))?;
        if self.cmd.command == "rsync" {
            // rsync cannot reason about mapped paths
            if user
                .virtual_folders
                .iter()
                .any(|f| overlaps(&clean_virtual_path(&f.virtual_path), &vpath))
            {
                return Err(Error::OpUnsupported(
                    "rsync inside a virtual folder is not supported".to_string(),
                ));
            }
        }
        let fs = self.session.fs();
        let host = fs.resolve(&vpath)?;
        let inside_folder = user.virtual_folder_for_path(&vpath).is_some();
        if !inside_folder || user.is_virtual_folder_root(&vpath) {
            // fine: home subtree or a folder root
        } else if self.cmd.command.starts_with("git-") {
            return Err(Error::PermissionDenied(vpath.clone()));
        }
        self.check_quota_not_exhausted().await?;

        let mut args: Vec<String> = self
            .cmd
            .args
            .iter()
            .filter(|a| a.starts_with('-'))
            .cloned()
            .collect();
        if self.cmd.command == "rsync" {
            // shape symlink handling after the user's permissions
            if user.has_perm(Permission::CreateSymlinks, &vpath) {
                args.push("--munge-links".to_string());
            } else {
                args.push("--safe-links".to_string());
            }
        }
        args.push(host.to_string_lossy().to_string());

        let mut child = tokio::process::Command::new(&self.cmd.command)
            .args(&args)
            .current_dir(&user.home_dir)
            .env("TIDEGATE_ACTION_USERNAME", &user.username)
            .env("TIDEGATE_ACTION_PATH", host.as_os_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Generic(format!("cannot start {}: {}", self.cmd.command, e)))?;

        let mut stdin = child.stdin.take();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        // channel -> child stdin
        let stdin_task = tokio::spawn(async move {
            if let Some(stdin) = stdin.as_mut() {
                while let Some(input) = rx.recv().await {
                    match input {
                        ChannelInput::Data(data) => {
                            if stdin.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        ChannelInput::Eof => break,
                    }
                }
                let _ = stdin.shutdown().await;
            }
        });

        // child stdout/stderr -> channel
        let handle = self.handle.clone();
        let channel = self.channel;
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout.as_mut() {
                let mut buf = vec![0u8; HASH_CHUNK];
                while let Ok(n) = stdout.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if handle
                        .data(channel, russh::CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });
        let handle = self.handle.clone();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr.as_mut() {
                let mut buf = vec![0u8; HASH_CHUNK];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if handle
                        .extended_data(channel, 1, russh::CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Generic(format!("wait failed: {}", e)))?;
        stdin_task.abort();
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        info!(
            connection_id = %self.session.id(),
            command = %self.cmd.command,
            code = ?status.code(),
            "system command finished"
        );
        Ok(status.code().unwrap_or(255) as u32)
    }

    async fn check_quota_not_exhausted(&self) -> Result<()> {
        let user = self.session.user();
        if self.provider.quota_tracking() == QuotaTracking::Off {
            return Ok(());
        }
        if !user.has_quota_restrictions() {
            return Ok(());
        }
        let (files, size) = self.provider.get_used_quota(&user.username).await?;
        if (user.quota_files > 0 && files >= user.quota_files)
            || (user.quota_size > 0 && size >= user.quota_size)
        {
            return Err(Error::QuotaExceeded(user.username.clone()));
        }
        Ok(())
    }

    // ----- internal recursive copy/remove -----

    async fn run_copy(&self) -> Result<u32> {
        let (source, target) = match self.cmd.args.as_slice() {
            [source, target] => (clean_virtual_path(source), clean_virtual_path(target)),
            _ => {
                return Err(Error::Protocol(
                    "tidegate-copy needs <source> <target>".to_string(),
                ))
            }
        };
        let user = self.session.user().clone();
        let fs = self.session.fs().clone();
        let metadata = fs.stat(&source).await?;

        let (files, bytes) = if metadata.is_dir() {
            vfs::dir_size(&fs.resolve(&source)?).await?
        } else {
            (1, metadata.len() as i64)
        };
        // a copy must fit in the destination quota before it starts
        upload_quota_check(&self.provider, &user, &target, true, 0).await?;
        if user.has_quota_restrictions() {
            let (used_files, used_size) = self.provider.get_used_quota(&user.username).await?;
            if (user.quota_files > 0 && used_files + files > user.quota_files)
                || (user.quota_size > 0 && used_size + bytes > user.quota_size)
            {
                return Err(Error::QuotaExceeded(target.clone()));
            }
        }

        let copied = self.copy_entry(&source, &target, &metadata).await?;
        self.send(format!("OK copied {} files\n", copied).as_bytes())
            .await?;
        Ok(0)
    }

    /// Copy one entry, recursing into directories; every visited entry
    /// is permission-checked on both sides
    fn copy_entry<'a>(
        &'a self,
        source: &'a str,
        target: &'a str,
        metadata: &'a std::fs::Metadata,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<i64>> + Send + 'a>> {
        Box::pin(async move {
            let user = self.session.user();
            let fs = self.session.fs();
            if metadata.is_dir() {
                if !user.has_perm(Permission::List, source) {
                    return Err(Error::PermissionDenied(source.to_string()));
                }
                if !user.has_perm(Permission::CreateDirs, target) {
                    return Err(Error::PermissionDenied(target.to_string()));
                }
                if fs.stat(target).await.is_err() {
                    fs.mkdir(target).await?;
                }
                let mut copied = 0;
                for (name, _) in fs.read_dir(source).await? {
                    let child_src = join_virtual(source, &name);
                    let child_dst = join_virtual(target, &name);
                    let child_meta = fs.lstat(&child_src).await?;
                    if child_meta.file_type().is_symlink() {
                        continue;
                    }
                    copied += self.copy_entry(&child_src, &child_dst, &child_meta).await?;
                }
                Ok(copied)
            } else {
                if !user.has_perm(Permission::Download, source) {
                    return Err(Error::PermissionDenied(source.to_string()));
                }
                let exists = fs.stat(target).await.is_ok();
                let needed = if exists {
                    Permission::Overwrite
                } else {
                    Permission::Upload
                };
                if !user.has_perm(needed, target) {
                    return Err(Error::PermissionDenied(target.to_string()));
                }
                let src_host = fs.resolve(source)?;
                let dst_host = fs.resolve(target)?;
                tokio::fs::copy(&src_host, &dst_host)
                    .await
                    .map_err(|e| Error::from_io(e, source))?;
                self.charge(target, 1, metadata.len() as i64).await;
                Ok(1)
            }
        })
    }

    async fn run_remove(&self) -> Result<u32> {
        let target = match self.cmd.args.as_slice() {
            [target] => clean_virtual_path(target),
            _ => return Err(Error::Protocol("tidegate-remove needs <target>".to_string())),
        };
        let user = self.session.user();
        if target == "/" || user.is_virtual_folder_root(&target) {
            return Err(Error::PermissionDenied(target));
        }
        let fs = self.session.fs();
        let metadata = fs.lstat(&target).await?;
        let removed = self.remove_entry(&target, &metadata).await?;
        self.send(format!("OK removed {} files\n", removed).as_bytes())
            .await?;
        Ok(0)
    }

    fn remove_entry<'a>(
        &'a self,
        target: &'a str,
        metadata: &'a std::fs::Metadata,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<i64>> + Send + 'a>> {
        Box::pin(async move {
            let user = self.session.user();
            let fs = self.session.fs();
            if !user.has_perm(Permission::Delete, target) {
                return Err(Error::PermissionDenied(target.to_string()));
            }
            if metadata.is_dir() && !metadata.file_type().is_symlink() {
                let mut removed = 0;
                for (name, _) in fs.read_dir(target).await? {
                    let child = join_virtual(target, &name);
                    let child_meta = fs.lstat(&child).await?;
                    removed += self.remove_entry(&child, &child_meta).await?;
                }
                fs.remove(target, true).await?;
                Ok(removed)
            } else {
                let size = metadata.len() as i64;
                fs.remove(target, false).await?;
                self.charge(target, -1, -size).await;
                Ok(1)
            }
        })
    }

    async fn charge(&self, vpath: &str, files: i64, bytes: i64) {
        let user = self.session.user();
        match self.provider.quota_tracking() {
            QuotaTracking::Off => return,
            QuotaTracking::RestrictionsOnly if !user.has_quota_restrictions() => return,
            _ => {}
        }
        if let Some(folder) = user.virtual_folder_for_path(vpath) {
            let _ = self
                .provider
                .update_folder_quota(&folder.name, files, bytes, false)
                .await;
            if !folder.is_included_in_user_quota() {
                return;
            }
        }
        let _ = self
            .provider
            .update_user_quota(&user.username, files, bytes, false)
            .await;
    }

    async fn notify_ssh_cmd(&self, command: &str, err: Option<&Error>) {
        let full = match self.cmd.args.is_empty() {
            true => command.to_string(),
            false => format!("{} {}", command, self.cmd.args.join(" ")),
        };
        let notification = ActionNotification::new(
            self.session.user(),
            OPERATION_SSH_CMD,
            &self.cmd.args.first().cloned().unwrap_or_default(),
            None,
            Some(&full),
            0,
            err,
        );
        let config = self.actions.clone();
        tokio::spawn(async move {
            if let Err(e) = actions::execute_action(&config, notification).await {
                debug!(error = %e, "ssh_cmd notification skipped or failed");
            }
        });
    }
}

/// True when one virtual path contains the other
fn overlaps(a: &str, b: &str) -> bool {
    let inside = |prefix: &str, path: &str| {
        prefix == "/" || path == prefix || path.starts_with(&format!("{}/", prefix))
    };
    inside(a, b) || inside(b, a)
}

fn join_virtual(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Streaming digest over the hash command name
enum MultiHasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl MultiHasher {
    fn new(command: &str) -> Result<Self> {
        match command {
            "md5sum" => Ok(MultiHasher::Md5(Md5::new())),
            "sha1sum" => Ok(MultiHasher::Sha1(Sha1::new())),
            "sha256sum" => Ok(MultiHasher::Sha256(Sha256::new())),
            "sha384sum" => Ok(MultiHasher::Sha384(Sha384::new())),
            "sha512sum" => Ok(MultiHasher::Sha512(Sha512::new())),
            other => Err(Error::OpUnsupported(format!("hash command {}", other))),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            MultiHasher::Md5(h) => h.update(data),
            MultiHasher::Sha1(h) => h.update(data),
            MultiHasher::Sha256(h) => h.update(data),
            MultiHasher::Sha384(h) => h.update(data),
            MultiHasher::Sha512(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            MultiHasher::Md5(h) => format!("{:x}", h.finalize()),
            MultiHasher::Sha1(h) => format!("{:x}", h.finalize()),
            MultiHasher::Sha256(h) => format!("{:x}", h.finalize()),
            MultiHasher::Sha384(h) => format!("{:x}", h.finalize()),
            MultiHasher::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}
