//! SFTP request handler.
//!
//! One [`SftpChannel`] per accepted `sftp` subsystem channel. Requests
//! are processed strictly in arrival order; for every operation the
//! handler resolves the virtual path, evaluates permissions at the
//! deepest matching prefix, applies the enclosing extension filter,
//! performs the operation and records an action notification.

use bytes::Bytes;
use russh::server::Handle;
use russh::ChannelId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::actions::{
    self, ActionNotification, ActionsConfig, OPERATION_DELETE, OPERATION_DOWNLOAD,
    OPERATION_RENAME, OPERATION_UPLOAD,
};
use crate::config::{SetstatMode, UploadMode};
use crate::error::{Error, Result};
use crate::protocol::{
    codec, reply, FileAttrs, MessageType, OpenFlags, PacketDecoder, StatusCode,
};
use crate::registry::ConnectionRegistry;
use crate::session::ServerSession;
use crate::transfer::{Transfer, TransferFile, TransferType, UploadOptions};
use crate::vfs;
use tidegate_core::{clean_virtual_path, Permission, QuotaTracking, User};
use tidegate_provider::DataProvider;

/// Directory entries sent per READDIR response
const READDIR_BATCH: usize = 100;

/// Cap on simultaneously open handles per channel
const MAX_OPEN_HANDLES: usize = 1024;

/// Input fed to the channel task by the SSH event loop
#[derive(Debug)]
pub enum ChannelInput {
    Data(Vec<u8>),
    Eof,
}

/// Where replies go: the live SSH channel, or an in-memory buffer used
/// by the test harness
pub enum OutputSink {
    Channel { handle: Handle, channel: ChannelId },
    Buffer(Vec<Bytes>),
}

impl OutputSink {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        match self {
            OutputSink::Channel { handle, channel } => handle
                .data(*channel, russh::CryptoVec::from_slice(&data))
                .await
                .map_err(|_| Error::Connection("channel write failed".to_string())),
            OutputSink::Buffer(buf) => {
                buf.push(data);
                Ok(())
            }
        }
    }
}

enum SftpHandle {
    File(Arc<Transfer>),
    Dir {
        entries: Vec<(String, FileAttrs)>,
        index: usize,
    },
}

pub struct SftpChannel {
    session: Arc<ServerSession>,
    registry: Arc<ConnectionRegistry>,
    provider: Arc<dyn DataProvider>,
    actions: ActionsConfig,
    upload_mode: UploadMode,
    setstat_mode: SetstatMode,
    out: OutputSink,
    handles: HashMap<String, SftpHandle>,
    next_handle_id: u64,
    decoder: PacketDecoder,
    initialized: bool,
}

impl SftpChannel {
    pub fn new(
        session: Arc<ServerSession>,
        registry: Arc<ConnectionRegistry>,
        provider: Arc<dyn DataProvider>,
        actions: ActionsConfig,
        upload_mode: UploadMode,
        setstat_mode: SetstatMode,
        out: OutputSink,
    ) -> Self {
        Self {
            session,
            registry,
            provider,
            actions,
            upload_mode,
            setstat_mode,
            out,
            handles: HashMap::new(),
            next_handle_id: 0,
            decoder: PacketDecoder::new(),
            initialized: false,
        }
    }

    /// Drive the channel until EOF or a fatal protocol error
    pub async fn run(mut self, mut rx: mpsc::Receiver<ChannelInput>) {
        let mut exit_status = 0u32;
        'outer: loop {
            let input = match rx.recv().await {
                Some(input) => input,
                None => break,
            };
            match input {
                ChannelInput::Eof => break,
                ChannelInput::Data(data) => {
                    self.decoder.push(&data);
                    loop {
                        match self.decoder.next_packet() {
                            Ok(Some((ty, payload))) => {
                                if let Err(e) = self.handle_packet(ty, &payload).await {
                                    warn!(
                                        connection_id = %self.session.id(),
                                        error = %e,
                                        "fatal sftp channel error"
                                    );
                                    exit_status = 1;
                                    break 'outer;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                error!(
                                    connection_id = %self.session.id(),
                                    error = %e,
                                    "sftp framing error"
                                );
                                exit_status = 1;
                                break 'outer;
                            }
                        }
                    }
                    self.session.touch();
                }
            }
        }
        self.shutdown(exit_status).await;
    }

    /// Dispatch one packet. Operational failures are answered with a
    /// STATUS reply; an error return tears the channel down.
    pub async fn handle_packet(&mut self, ty: u8, payload: &[u8]) -> Result<()> {
        let msg_type = MessageType::try_from(ty)?;
        if !self.initialized && msg_type != MessageType::Init {
            return Err(Error::Protocol(format!(
                "{:?} before initialization",
                msg_type
            )));
        }
        let mut buf = payload;
        match msg_type {
            MessageType::Init => {
                let version = codec::get_u32(&mut buf)?;
                debug!(connection_id = %self.session.id(), version, "sftp init");
                self.initialized = true;
                self.out.send(reply::version()).await
            }
            MessageType::Open => self.handle_open(&mut buf).await,
            MessageType::Close => self.handle_close(&mut buf).await,
            MessageType::Read => self.handle_read(&mut buf).await,
            MessageType::Write => self.handle_write(&mut buf).await,
            MessageType::Stat => self.handle_stat(&mut buf, true).await,
            MessageType::Lstat => self.handle_stat(&mut buf, false).await,
            MessageType::Fstat => self.handle_fstat(&mut buf).await,
            MessageType::Setstat => self.handle_setstat(&mut buf).await,
            MessageType::Fsetstat => self.handle_fsetstat(&mut buf).await,
            MessageType::Opendir => self.handle_opendir(&mut buf).await,
            MessageType::Readdir => self.handle_readdir(&mut buf).await,
            MessageType::Remove => self.handle_remove(&mut buf).await,
            MessageType::Mkdir => self.handle_mkdir(&mut buf).await,
            MessageType::Rmdir => self.handle_rmdir(&mut buf).await,
            MessageType::Realpath => self.handle_realpath(&mut buf).await,
            MessageType::Rename => self.handle_rename(&mut buf).await,
            MessageType::Readlink => self.handle_readlink(&mut buf).await,
            MessageType::Symlink => self.handle_symlink(&mut buf).await,
            MessageType::Extended => self.handle_extended(&mut buf).await,
            other => {
                let request_id = codec::get_u32(&mut buf).unwrap_or(0);
                warn!(?other, "unsupported sftp message");
                self.send_status_err(
                    request_id,
                    &Error::OpUnsupported(format!("{:?}", other)),
                )
                .await
            }
        }
    }

    /// Replies sent so far; test harness only
    pub fn drain_output(&mut self) -> Vec<Bytes> {
        match &mut self.out {
            OutputSink::Buffer(buf) => std::mem::take(buf),
            OutputSink::Channel { .. } => Vec::new(),
        }
    }

    fn user(&self) -> &Arc<User> {
        self.session.user()
    }

    async fn send_status(&mut self, request_id: u32, code: StatusCode, msg: &str) -> Result<()> {
        self.out.send(reply::status(request_id, code, msg)).await
    }

    async fn send_status_err(&mut self, request_id: u32, err: &Error) -> Result<()> {
        if err.is_security_event() {
            warn!(
                connection_id = %self.session.id(),
                username = %self.user().username,
                error = %err,
                "request denied"
            );
        }
        self.send_status(request_id, err.to_status_code(), &err.sanitized_message())
            .await
    }

    async fn send_ok(&mut self, request_id: u32) -> Result<()> {
        self.send_status(request_id, StatusCode::Ok, "Success").await
    }

    fn allocate_handle(&mut self, handle: SftpHandle) -> String {
        let id = format!("h{}", self.next_handle_id);
        self.next_handle_id += 1;
        self.handles.insert(id.clone(), handle);
        id
    }

    async fn handle_open(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let filename = codec::get_string(buf)?;
        let pflags = OpenFlags(codec::get_u32(buf)?);
        let _attrs = FileAttrs::decode(buf)?;
        let vpath = clean_virtual_path(&filename);

        if self.handles.len() >= MAX_OPEN_HANDLES {
            return self
                .send_status_err(
                    request_id,
                    &Error::Generic("too many open handles".to_string()),
                )
                .await;
        }

        let result = if pflags.has_write() {
            self.open_for_upload(&vpath, pflags).await
        } else {
            self.open_for_download(&vpath).await
        };
        match result {
            Ok(handle) => {
                let id = self.allocate_handle(handle);
                self.out.send(reply::handle(request_id, &id)).await
            }
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn open_for_download(&mut self, vpath: &str) -> Result<SftpHandle> {
        let user = self.user().clone();
        if !user.has_perm(Permission::Download, vpath) {
            return Err(Error::PermissionDenied(vpath.to_string()));
        }
        if !user.is_file_allowed(vpath) {
            return Err(Error::PermissionDenied(vpath.to_string()));
        }
        let fs = self.session.fs();
        let host = fs.resolve(vpath)?;
        let file = fs.open_read(vpath).await?;
        let transfer = Transfer::new_download(
            self.session.id(),
            user,
            self.provider.clone(),
            vpath,
            host,
            TransferFile::Local(file),
        );
        self.registry.add_transfer(transfer.clone());
        Ok(SftpHandle::File(transfer))
    }

    async fn open_for_upload(&mut self, vpath: &str, flags: OpenFlags) -> Result<SftpHandle> {
        let request = UploadRequest {
            vpath: vpath.to_string(),
            truncate: flags.has_trunc(),
            resume: flags.has_append() && !flags.has_trunc(),
            exclusive: flags.has_excl(),
        };
        let transfer = begin_upload(
            &self.session,
            &self.registry,
            &self.provider,
            self.upload_mode,
            request,
        )
        .await?;
        Ok(SftpHandle::File(transfer))
    }

    async fn handle_close(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;
        let Some(handle) = self.handles.remove(&handle_id) else {
            return self
                .send_status_err(request_id, &Error::Generic("invalid handle".to_string()))
                .await;
        };
        match handle {
            SftpHandle::Dir { .. } => self.send_ok(request_id).await,
            SftpHandle::File(transfer) => {
                let result = transfer.close(None).await;
                self.finish_transfer(&transfer, &result).await;
                match result {
                    Ok(_) => self.send_ok(request_id).await,
                    Err(e) => self.send_status_err(request_id, &e).await,
                }
            }
        }
    }

    /// Post-close bookkeeping shared by CLOSE and channel teardown
    async fn finish_transfer(&self, transfer: &Arc<Transfer>, result: &Result<i64>) {
        finish_transfer(&self.session, &self.registry, &self.actions, transfer, result).await;
    }

    async fn handle_read(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;
        let offset = codec::get_u64(buf)?;
        let len = codec::get_u32(buf)?;
        let Some(SftpHandle::File(transfer)) = self.handles.get(&handle_id) else {
            return self
                .send_status_err(request_id, &Error::Generic("invalid handle".to_string()))
                .await;
        };
        let transfer = transfer.clone();
        match transfer.read_at(offset, len).await {
            Ok(data) if data.is_empty() => {
                self.send_status(request_id, StatusCode::Eof, "End of file").await
            }
            Ok(data) => self.out.send(reply::data(request_id, &data)).await,
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_write(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;
        let offset = codec::get_u64(buf)?;
        let data = codec::get_bytes(buf)?;
        let Some(SftpHandle::File(transfer)) = self.handles.get(&handle_id) else {
            return self
                .send_status_err(request_id, &Error::Generic("invalid handle".to_string()))
                .await;
        };
        let transfer = transfer.clone();
        match transfer.write_at(offset, &data).await {
            Ok(()) => self.send_ok(request_id).await,
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_stat(&mut self, buf: &mut &[u8], follow: bool) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let vpath = clean_virtual_path(&codec::get_string(buf)?);
        if !self.user().has_perm(Permission::List, &vpath) {
            return self
                .send_status_err(request_id, &Error::PermissionDenied(vpath))
                .await;
        }
        let fs = self.session.fs();
        let result = if follow {
            fs.stat(&vpath).await
        } else {
            fs.lstat(&vpath).await
        };
        match result {
            Ok(metadata) => {
                self.out
                    .send(reply::attrs(request_id, &FileAttrs::from_metadata(&metadata)))
                    .await
            }
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_fstat(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;
        let Some(SftpHandle::File(transfer)) = self.handles.get(&handle_id) else {
            return self
                .send_status_err(request_id, &Error::Generic("invalid handle".to_string()))
                .await;
        };
        let vpath = transfer.virtual_path().to_string();
        match self.session.fs().stat(&vpath).await {
            Ok(metadata) => {
                self.out
                    .send(reply::attrs(request_id, &FileAttrs::from_metadata(&metadata)))
                    .await
            }
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_setstat(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let vpath = clean_virtual_path(&codec::get_string(buf)?);
        let attrs = FileAttrs::decode(buf)?;
        match self.apply_setstat(&vpath, &attrs).await {
            Ok(()) => self.send_ok(request_id).await,
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_fsetstat(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;
        let attrs = FileAttrs::decode(buf)?;
        let Some(SftpHandle::File(transfer)) = self.handles.get(&handle_id) else {
            return self
                .send_status_err(request_id, &Error::Generic("invalid handle".to_string()))
                .await;
        };
        let vpath = transfer.virtual_path().to_string();
        match self.apply_setstat(&vpath, &attrs).await {
            Ok(()) => self.send_ok(request_id).await,
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn apply_setstat(&self, vpath: &str, attrs: &FileAttrs) -> Result<()> {
        if self.setstat_mode == SetstatMode::Ignore {
            return Ok(());
        }
        let user = self.user();
        let fs = self.session.fs();
        if let Some(mode) = attrs.permissions {
            if !user.has_perm(Permission::Chmod, vpath) {
                return Err(Error::PermissionDenied(vpath.to_string()));
            }
            fs.set_permissions(vpath, mode & 0o7777).await?;
        }
        if let (Some(uid), Some(gid)) = (attrs.uid, attrs.gid) {
            if !user.has_perm(Permission::Chown, vpath) {
                return Err(Error::PermissionDenied(vpath.to_string()));
            }
            fs.set_owner(vpath, uid, gid).await?;
        }
        if let (Some(atime), Some(mtime)) = (attrs.atime, attrs.mtime) {
            if !user.has_perm(Permission::Chtimes, vpath) {
                return Err(Error::PermissionDenied(vpath.to_string()));
            }
            fs.set_times(vpath, atime, mtime).await?;
        }
        if let Some(size) = attrs.size {
            if !user.has_perm(Permission::Overwrite, vpath) {
                return Err(Error::PermissionDenied(vpath.to_string()));
            }
            fs.truncate(vpath, size).await?;
        }
        Ok(())
    }

    async fn handle_opendir(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let vpath = clean_virtual_path(&codec::get_string(buf)?);
        if !self.user().has_perm(Permission::List, &vpath) {
            return self
                .send_status_err(request_id, &Error::PermissionDenied(vpath))
                .await;
        }
        match self.session.fs().read_dir(&vpath).await {
            Ok(entries) => {
                let id = self.allocate_handle(SftpHandle::Dir { entries, index: 0 });
                self.out.send(reply::handle(request_id, &id)).await
            }
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_readdir(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let handle_id = codec::get_string(buf)?;
        let Some(SftpHandle::Dir { entries, index }) = self.handles.get_mut(&handle_id) else {
            return self
                .send_status_err(request_id, &Error::Generic("invalid handle".to_string()))
                .await;
        };
        if *index >= entries.len() {
            return self
                .send_status(request_id, StatusCode::Eof, "End of directory")
                .await;
        }
        let end = (*index + READDIR_BATCH).min(entries.len());
        let batch = entries[*index..end].to_vec();
        *index = end;
        self.out.send(reply::name(request_id, &batch)).await
    }

    async fn handle_remove(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let vpath = clean_virtual_path(&codec::get_string(buf)?);
        match self.do_remove(&vpath).await {
            Ok(()) => self.send_ok(request_id).await,
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn do_remove(&mut self, vpath: &str) -> Result<()> {
        let user = self.user().clone();
        if !user.has_perm(Permission::Delete, vpath) {
            return Err(Error::PermissionDenied(vpath.to_string()));
        }
        if !user.is_file_allowed(vpath) {
            return Err(Error::PermissionDenied(vpath.to_string()));
        }
        let fs = self.session.fs();
        let metadata = fs.lstat(vpath).await?;
        if metadata.is_dir() {
            return Err(Error::Generic(format!("{} is a directory", vpath)));
        }
        let size = metadata.len() as i64;

        // permission check first, hook second, delete third
        if actions::execute_pre_delete_action(&self.actions, &user, vpath, size).await? {
            debug!(path = vpath, "delete handled by pre-delete hook");
            return Ok(());
        }

        let result = fs.remove(vpath, false).await;
        if result.is_ok() && metadata.is_file() {
            self.charge_removal(&user, vpath, -1, -size).await;
        }
        self.notify(OPERATION_DELETE, vpath, None, None, size, result.as_ref().err())
            .await;
        result
    }

    async fn charge_removal(&self, user: &User, vpath: &str, files: i64, size: i64) {
        match self.provider.quota_tracking() {
            QuotaTracking::Off => return,
            QuotaTracking::RestrictionsOnly if !user.has_quota_restrictions() => return,
            _ => {}
        }
        if let Some(folder) = user.virtual_folder_for_path(vpath) {
            if let Err(e) = self
                .provider
                .update_folder_quota(&folder.name, files, size, false)
                .await
            {
                warn!(folder = %folder.name, error = %e, "folder quota update failed");
            }
            if !folder.is_included_in_user_quota() {
                return;
            }
        }
        if let Err(e) = self
            .provider
            .update_user_quota(&user.username, files, size, false)
            .await
        {
            warn!(username = %user.username, error = %e, "user quota update failed");
        }
    }

    async fn handle_mkdir(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let vpath = clean_virtual_path(&codec::get_string(buf)?);
        let _attrs = FileAttrs::decode(buf)?;
        if !self.user().has_perm(Permission::CreateDirs, &vpath) {
            return self
                .send_status_err(request_id, &Error::PermissionDenied(vpath))
                .await;
        }
        match self.session.fs().mkdir(&vpath).await {
            Ok(()) => self.send_ok(request_id).await,
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_rmdir(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let vpath = clean_virtual_path(&codec::get_string(buf)?);
        let user = self.user().clone();
        if user.is_virtual_folder_root(&vpath) {
            return self
                .send_status_err(request_id, &Error::PermissionDenied(vpath))
                .await;
        }
        if !user.has_perm(Permission::Delete, &vpath) {
            return self
                .send_status_err(request_id, &Error::PermissionDenied(vpath))
                .await;
        }
        match self.session.fs().remove(&vpath, true).await {
            Ok(()) => self.send_ok(request_id).await,
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_realpath(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let vpath = clean_virtual_path(&codec::get_string(buf)?);
        let attrs = match self.session.fs().stat(&vpath).await {
            Ok(metadata) => FileAttrs::from_metadata(&metadata),
            Err(_) => FileAttrs::default(),
        };
        self.out
            .send(reply::name(request_id, &[(vpath, attrs)]))
            .await
    }

    async fn handle_rename(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let source = clean_virtual_path(&codec::get_string(buf)?);
        let target = clean_virtual_path(&codec::get_string(buf)?);
        match self.do_rename(&source, &target).await {
            Ok(()) => self.send_ok(request_id).await,
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn do_rename(&mut self, source: &str, target: &str) -> Result<()> {
        let user = self.user().clone();
        let fs = self.session.fs().clone();
        if user.is_virtual_folder_root(source) {
            return Err(Error::PermissionDenied(format!(
                "renaming the virtual folder {} is not allowed",
                source
            )));
        }
        if !user.is_file_allowed(target) {
            return Err(Error::PermissionDenied(target.to_string()));
        }
        let metadata = fs.lstat(source).await?;
        if !can_rename(&user, source, target, &metadata) {
            return Err(Error::PermissionDenied(format!("{} -> {}", source, target)));
        }

        let source_folder = user.virtual_folder_for_path(source).cloned();
        let target_folder = user.virtual_folder_for_path(target).cloned();
        let crosses_boundary = source_folder.as_ref().map(|f| f.name.as_str())
            != target_folder.as_ref().map(|f| f.name.as_str());

        let mut moved: Option<(i64, i64)> = None;
        if crosses_boundary {
            let (files, bytes) = if metadata.is_dir() {
                let host = fs.resolve(source)?;
                self.check_recursive_rename_perms(&fs, source, target).await?;
                vfs::dir_size(&host).await?
            } else {
                (1, metadata.len() as i64)
            };
            self.check_rename_quota(&user, target_folder.as_ref(), files, bytes)
                .await?;
            moved = Some((files, bytes));
        }

        let result = fs.rename(source, target).await;
        if result.is_ok() {
            if let Some((files, bytes)) = moved {
                self.account_cross_rename(
                    &user,
                    source_folder.as_ref(),
                    target_folder.as_ref(),
                    files,
                    bytes,
                )
                .await;
            }
        }
        self.notify(
            OPERATION_RENAME,
            source,
            Some(target),
            None,
            0,
            result.as_ref().err(),
        )
        .await;
        result
    }

    /// Every entry moved across a virtual-folder boundary must be
    /// individually permitted on both sides
    async fn check_recursive_rename_perms(
        &self,
        fs: &Arc<crate::vfs::VirtualFs>,
        source: &str,
        target: &str,
    ) -> Result<()> {
        let user = self.user();
        let host_root = fs.resolve(source)?;
        let mut stack = vec![host_root.clone()];
        while let Some(dir) = stack.pop() {
            let mut reader = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Error::from_io(e, source))?;
            while let Some(entry) = reader
                .next_entry()
                .await
                .map_err(|e| Error::from_io(e, source))?
            {
                let rel = entry
                    .path()
                    .strip_prefix(&host_root)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                let src_v = format!("{}/{}", source.trim_end_matches('/'), rel);
                let dst_v = format!("{}/{}", target.trim_end_matches('/'), rel);
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| Error::from_io(e, source))?;
                if !can_rename(user, &src_v, &dst_v, &metadata) {
                    return Err(Error::PermissionDenied(format!("{} -> {}", src_v, dst_v)));
                }
                if metadata.is_dir() {
                    stack.push(entry.path());
                }
            }
        }
        Ok(())
    }

    /// The destination keyspace must have room for the moved tree
    async fn check_rename_quota(
        &self,
        user: &User,
        target_folder: Option<&tidegate_core::VirtualFolder>,
        files: i64,
        bytes: i64,
    ) -> Result<()> {
        if self.provider.quota_tracking() == QuotaTracking::Off {
            return Ok(());
        }
        let (quota_files, quota_size, used) = match target_folder {
            Some(folder) if folder.has_quota_restrictions() => (
                folder.quota_files,
                folder.quota_size,
                self.provider.get_used_folder_quota(&folder.name).await?,
            ),
            _ => {
                if !user.has_quota_restrictions() {
                    return Ok(());
                }
                (
                    user.quota_files,
                    user.quota_size,
                    self.provider.get_used_quota(&user.username).await?,
                )
            }
        };
        if quota_files > 0 && used.0 + files > quota_files {
            return Err(Error::QuotaExceeded("no file slots at destination".to_string()));
        }
        if quota_size > 0 && used.1 + bytes > quota_size {
            return Err(Error::QuotaExceeded("no space at destination".to_string()));
        }
        Ok(())
    }

    async fn account_cross_rename(
        &self,
        user: &User,
        source_folder: Option<&tidegate_core::VirtualFolder>,
        target_folder: Option<&tidegate_core::VirtualFolder>,
        files: i64,
        bytes: i64,
    ) {
        if self.provider.quota_tracking() == QuotaTracking::Off {
            return;
        }
        // subtract from the source keyspace
        match source_folder {
            Some(folder) => {
                let _ = self
                    .provider
                    .update_folder_quota(&folder.name, -files, -bytes, false)
                    .await;
                if folder.is_included_in_user_quota() {
                    let _ = self
                        .provider
                        .update_user_quota(&user.username, -files, -bytes, false)
                        .await;
                }
            }
            None => {
                let _ = self
                    .provider
                    .update_user_quota(&user.username, -files, -bytes, false)
                    .await;
            }
        }
        // add to the destination keyspace
        match target_folder {
            Some(folder) => {
                let _ = self
                    .provider
                    .update_folder_quota(&folder.name, files, bytes, false)
                    .await;
                if folder.is_included_in_user_quota() {
                    let _ = self
                        .provider
                        .update_user_quota(&user.username, files, bytes, false)
                        .await;
                }
            }
            None => {
                let _ = self
                    .provider
                    .update_user_quota(&user.username, files, bytes, false)
                    .await;
            }
        }
    }

    async fn handle_readlink(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let vpath = clean_virtual_path(&codec::get_string(buf)?);
        if !self.user().has_perm(Permission::List, &vpath) {
            return self
                .send_status_err(request_id, &Error::PermissionDenied(vpath))
                .await;
        }
        match self.session.fs().read_link(&vpath).await {
            Ok(target) => {
                self.out
                    .send(reply::name(request_id, &[(target, FileAttrs::default())]))
                    .await
            }
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_symlink(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let linkpath = clean_virtual_path(&codec::get_string(buf)?);
        let targetpath = codec::get_string(buf)?;
        if !self.user().has_perm(Permission::CreateSymlinks, &linkpath) {
            return self
                .send_status_err(request_id, &Error::PermissionDenied(linkpath))
                .await;
        }
        match self.session.fs().symlink(&targetpath, &linkpath).await {
            Ok(()) => self.send_ok(request_id).await,
            Err(e) => self.send_status_err(request_id, &e).await,
        }
    }

    async fn handle_extended(&mut self, buf: &mut &[u8]) -> Result<()> {
        let request_id = codec::get_u32(buf)?;
        let name = codec::get_string(buf)?;
        match name.as_str() {
            "posix-rename@openssh.com" => {
                let source = clean_virtual_path(&codec::get_string(buf)?);
                let target = clean_virtual_path(&codec::get_string(buf)?);
                match self.do_rename(&source, &target).await {
                    Ok(()) => self.send_ok(request_id).await,
                    Err(e) => self.send_status_err(request_id, &e).await,
                }
            }
            other => {
                self.send_status_err(request_id, &Error::OpUnsupported(other.to_string()))
                    .await
            }
        }
    }

    async fn notify(
        &self,
        operation: &str,
        path: &str,
        target: Option<&str>,
        ssh_cmd: Option<&str>,
        file_size: i64,
        err: Option<&Error>,
    ) {
        let notification = ActionNotification::new(
            self.user(),
            operation,
            path,
            target,
            ssh_cmd,
            file_size,
            err,
        );
        let config = self.actions.clone();
        tokio::spawn(async move {
            if let Err(e) = actions::execute_action(&config, notification).await {
                debug!(error = %e, "action notification skipped or failed");
            }
        });
    }

    /// Channel teardown: close dangling transfers with a connection
    /// error, then settle the exit status
    async fn shutdown(mut self, exit_status: u32) {
        let handles: Vec<SftpHandle> = self.handles.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let SftpHandle::File(transfer) = handle {
                let result = transfer
                    .close(Some(Error::Connection("channel closed".to_string())))
                    .await;
                self.finish_transfer(&transfer, &result).await;
            }
        }
        if let OutputSink::Channel { handle, channel } = &self.out {
            let _ = handle.exit_status_request(*channel, exit_status).await;
            let _ = handle.eof(*channel).await;
            let _ = handle.close(*channel).await;
        }
        debug!(connection_id = %self.session.id(), exit_status, "sftp channel closed");
    }
}

/// Transfer completion bookkeeping: registry removal, metrics, the
/// transfer log line and the action notification. Shared by the SFTP
/// handler and the SCP engine.
pub(crate) async fn finish_transfer(
    session: &Arc<ServerSession>,
    registry: &Arc<ConnectionRegistry>,
    actions: &ActionsConfig,
    transfer: &Arc<Transfer>,
    result: &Result<i64>,
) {
    registry.remove_transfer(transfer.id());
    let err = result.as_ref().err();
    let size = match result {
        Ok(size) => *size,
        Err(_) => transfer.bytes_received() as i64,
    };
    let ok = err.is_none();
    let operation = match transfer.transfer_type() {
        TransferType::Upload => {
            registry.metrics().upload_completed(ok);
            registry.metrics().add_bytes_received(transfer.bytes_received());
            OPERATION_UPLOAD
        }
        TransferType::Download => {
            registry.metrics().download_completed(ok);
            registry.metrics().add_bytes_sent(transfer.bytes_sent());
            OPERATION_DOWNLOAD
        }
    };
    info!(
        connection_id = %session.id(),
        username = %session.user().username,
        path = %transfer.virtual_path(),
        operation,
        size,
        ok,
        "transfer finished"
    );
    let notification = ActionNotification::new(
        session.user(),
        operation,
        transfer.virtual_path(),
        None,
        None,
        size,
        err,
    );
    let config = actions.clone();
    tokio::spawn(async move {
        if let Err(e) = actions::execute_action(&config, notification).await {
            debug!(error = %e, "action notification skipped or failed");
        }
    });
}

/// How an upload open behaves; derived from SFTP open flags or from the
/// SCP push defaults
pub(crate) struct UploadRequest {
    pub vpath: String,
    pub truncate: bool,
    pub resume: bool,
    pub exclusive: bool,
}

/// Open an upload transfer with the full policy chain: extension
/// filter, upload/overwrite permission, on-the-fly parent creation,
/// quota admission, and staging selection for the atomic modes. Shared
/// by the SFTP handler and the SCP engine.
pub(crate) async fn begin_upload(
    session: &Arc<ServerSession>,
    registry: &Arc<ConnectionRegistry>,
    provider: &Arc<dyn DataProvider>,
    upload_mode: UploadMode,
    request: UploadRequest,
) -> Result<Arc<Transfer>> {
    let user = session.user().clone();
    let fs = session.fs();
    let vpath = request.vpath.as_str();
    if !user.is_file_allowed(vpath) {
        return Err(Error::PermissionDenied(vpath.to_string()));
    }
    let host = fs.resolve(vpath)?;
    let existing = tokio::fs::metadata(&host).await.ok();
    let exists = existing.is_some();

    if exists {
        if !user.has_perm(Permission::Overwrite, vpath) {
            return Err(Error::PermissionDenied(vpath.to_string()));
        }
    } else if !user.has_perm(Permission::Upload, vpath) {
        return Err(Error::PermissionDenied(vpath.to_string()));
    }

    // a missing parent is created on the fly when the user may create
    // directories there
    if let Some(parent) = host.parent() {
        if tokio::fs::metadata(parent).await.is_err() {
            let parent_v = parent_virtual(vpath);
            if !user.has_perm(Permission::CreateDirs, &parent_v) {
                return Err(Error::PermissionDenied(parent_v));
            }
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io(e, vpath))?;
        }
    }

    let initial_size = existing.as_ref().map(|m| m.len()).unwrap_or(0);
    let is_new_file = !exists;
    let truncate = request.truncate || !exists;
    let resume = request.resume && exists;

    let max_write_size =
        upload_quota_check(provider, &user, vpath, is_new_file, initial_size).await?;

    let atomic = upload_mode != UploadMode::Standard && fs.is_atomic_upload_supported();
    let (open_path, staging) = if atomic {
        let staging = staging_path(&host);
        if resume {
            // move the partial target into staging so received bytes
            // stay contiguous with the resumed writes
            tokio::fs::rename(&host, &staging)
                .await
                .map_err(|e| Error::from_io(e, vpath))?;
        }
        (staging.clone(), Some(staging))
    } else {
        (host.clone(), None)
    };

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true);
    if truncate && !resume {
        options.truncate(true);
    }
    if request.exclusive {
        options.create_new(true);
    }
    let file = options
        .open(&open_path)
        .await
        .map_err(|e| Error::from_io(e, vpath))?;

    let transfer = Transfer::new_upload(
        session.id(),
        user,
        provider.clone(),
        vpath,
        host,
        staging,
        TransferFile::Local(file),
        UploadOptions {
            mode: upload_mode,
            is_new_file,
            initial_size: if truncate && !resume { initial_size } else { 0 },
            min_write_offset: if resume { initial_size } else { 0 },
            max_write_size,
        },
    );
    registry.add_transfer(transfer.clone());
    Ok(transfer)
}

/// Quota admission at open time. Returns the byte headroom for the
/// transfer (0 = unlimited), or `QuotaExceeded` when no new file or no
/// bytes may be stored.
pub(crate) async fn upload_quota_check(
    provider: &Arc<dyn DataProvider>,
    user: &User,
    vpath: &str,
    is_new_file: bool,
    initial_size: u64,
) -> Result<i64> {
    match provider.quota_tracking() {
        QuotaTracking::Off => return Ok(0),
        QuotaTracking::RestrictionsOnly | QuotaTracking::Full => {}
    }
    if let Some(folder) = user.virtual_folder_for_path(vpath) {
        if folder.has_quota_restrictions() {
            let (files, size) = provider.get_used_folder_quota(&folder.name).await?;
            return headroom(
                folder.quota_files,
                folder.quota_size,
                files,
                size,
                is_new_file,
                initial_size,
                vpath,
            );
        }
    }
    if !user.has_quota_restrictions() {
        return Ok(0);
    }
    let (files, size) = provider.get_used_quota(&user.username).await?;
    headroom(
        user.quota_files,
        user.quota_size,
        files,
        size,
        is_new_file,
        initial_size,
        vpath,
    )
}

/// Staging sibling for atomic uploads, unique per transfer
fn staging_path(target: &PathBuf) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let unique = uuid::Uuid::new_v4().simple().to_string();
    target
        .parent()
        .unwrap_or_else(|| std::path::Path::new("/"))
        .join(format!(".{}.{}.tmp", name, &unique[..8]))
}

/// Virtual parent directory of a cleaned virtual path
fn parent_virtual(vpath: &str) -> String {
    match vpath.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => vpath[..idx].to_string(),
    }
}

/// The rename permission policy: `rename` on both sides, or `delete` on
/// the source plus the write permission matching the entry kind on the
/// target
fn can_rename(user: &User, source: &str, target: &str, metadata: &std::fs::Metadata) -> bool {
    if user.has_perm(Permission::Rename, source) && user.has_perm(Permission::Rename, target) {
        return true;
    }
    if !user.has_perm(Permission::Delete, source) {
        return false;
    }
    if metadata.file_type().is_symlink() {
        return user.has_perm(Permission::CreateSymlinks, target);
    }
    if metadata.is_dir() {
        return user.has_perm(Permission::CreateDirs, target);
    }
    user.has_perm(Permission::Upload, target) || user.has_perm(Permission::Overwrite, target)
}

/// Compute the byte headroom for an upload, rejecting it outright when
/// the file-count cap is already reached
#[allow(clippy::too_many_arguments)]
fn headroom(
    quota_files: i64,
    quota_size: i64,
    used_files: i64,
    used_size: i64,
    is_new_file: bool,
    initial_size: u64,
    vpath: &str,
) -> Result<i64> {
    if is_new_file && quota_files > 0 && used_files >= quota_files {
        return Err(Error::QuotaExceeded(format!(
            "file limit reached uploading {}",
            vpath
        )));
    }
    if quota_size == 0 {
        return Ok(0);
    }
    let max = quota_size - used_size + initial_size as i64;
    if max <= 0 {
        return Err(Error::QuotaExceeded(format!(
            "size limit reached uploading {}",
            vpath
        )));
    }
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_virtual() {
        assert_eq!(parent_virtual("/a/b/c"), "/a/b");
        assert_eq!(parent_virtual("/a"), "/");
        assert_eq!(parent_virtual("/"), "/");
    }

    #[test]
    fn test_staging_path_is_sibling() {
        let staging = staging_path(&PathBuf::from("/srv/u1/in/file.bin"));
        assert_eq!(staging.parent().unwrap(), std::path::Path::new("/srv/u1/in"));
        let name = staging.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".file.bin."));
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn test_headroom() {
        // below the caps
        assert_eq!(headroom(4, 4096, 1, 1024, true, 0, "/x").unwrap(), 3072);
        // file cap reached for a new file
        assert!(headroom(4, 4096, 4, 0, true, 0, "/x").is_err());
        // overwrite at the cap gets the old size back as headroom
        assert_eq!(headroom(0, 4096, 0, 4096, false, 1000, "/x").unwrap(), 1000);
        // unlimited
        assert_eq!(headroom(0, 0, 99, 99999, true, 0, "/x").unwrap(), 0);
    }
}
