//! In-flight transfers.
//!
//! A [`Transfer`] owns one open handle for the lifetime of an upload or
//! download: byte counters, the resume watermark, atomic-rename staging
//! and the final quota charge. Close is exactly-once; an error is
//! reported only on the first call.
//!
//! Remote backends have no random-access writes, so their uploads go
//! through a sequential in-memory pipe whose background consumer reports
//! its terminal error as the close result.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::UploadMode;
use crate::error::{Error, Result};
use tidegate_core::{QuotaTracking, User};
use tidegate_provider::DataProvider;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Upload,
    Download,
}

/// The open handle behind a transfer
pub enum TransferFile {
    /// Random-access local file
    Local(fs::File),
    /// Sequential pipe feeding a background uploader; `done` resolves
    /// with the uploader's terminal result
    Pipe {
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        done: oneshot::Receiver<std::io::Result<()>>,
    },
}

/// Parameters fixed at upload start
pub struct UploadOptions {
    pub mode: UploadMode,
    pub is_new_file: bool,
    pub initial_size: u64,
    /// Writes below this offset fail; used for resumed uploads
    pub min_write_offset: u64,
    /// Quota headroom in bytes including the initial size, 0 = unlimited
    pub max_write_size: i64,
}

pub struct Transfer {
    id: u64,
    session_id: String,
    user: Arc<User>,
    provider: Arc<dyn DataProvider>,
    transfer_type: TransferType,
    virtual_path: String,
    host_path: PathBuf,
    staging_path: Option<PathBuf>,
    mode: UploadMode,

    file: Mutex<Option<TransferFile>>,
    closed: AtomicBool,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    start: Instant,
    start_time: DateTime<Utc>,
    last_activity: StdMutex<Instant>,

    min_write_offset: u64,
    initial_size: u64,
    is_new_file: bool,
    max_write_size: i64,

    /// First error observed during the transfer; folded into close
    error: StdMutex<Option<String>>,
    quota_error: AtomicBool,
    cancel: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Transfer {
    #[allow(clippy::too_many_arguments)]
    pub fn new_upload(
        session_id: impl Into<String>,
        user: Arc<User>,
        provider: Arc<dyn DataProvider>,
        virtual_path: impl Into<String>,
        host_path: PathBuf,
        staging_path: Option<PathBuf>,
        file: TransferFile,
        options: UploadOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed),
            session_id: session_id.into(),
            user,
            provider,
            transfer_type: TransferType::Upload,
            virtual_path: virtual_path.into(),
            host_path,
            staging_path,
            mode: options.mode,
            file: Mutex::new(Some(file)),
            closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start: Instant::now(),
            start_time: Utc::now(),
            last_activity: StdMutex::new(Instant::now()),
            min_write_offset: options.min_write_offset,
            initial_size: options.initial_size,
            is_new_file: options.is_new_file,
            max_write_size: options.max_write_size,
            error: StdMutex::new(None),
            quota_error: AtomicBool::new(false),
            cancel: StdMutex::new(None),
        })
    }

    pub fn new_download(
        session_id: impl Into<String>,
        user: Arc<User>,
        provider: Arc<dyn DataProvider>,
        virtual_path: impl Into<String>,
        host_path: PathBuf,
        file: TransferFile,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed),
            session_id: session_id.into(),
            user,
            provider,
            transfer_type: TransferType::Download,
            virtual_path: virtual_path.into(),
            host_path,
            staging_path: None,
            mode: UploadMode::Standard,
            file: Mutex::new(Some(file)),
            closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start: Instant::now(),
            start_time: Utc::now(),
            last_activity: StdMutex::new(Instant::now()),
            min_write_offset: 0,
            initial_size: 0,
            is_new_file: false,
            max_write_size: 0,
            error: StdMutex::new(None),
            quota_error: AtomicBool::new(false),
            cancel: StdMutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("activity lock poisoned")
    }

    pub fn is_new_file(&self) -> bool {
        self.is_new_file
    }

    /// Hook fired when the transfer fails; used to interrupt background
    /// pipe consumers
    pub fn set_cancel_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.cancel.lock().expect("cancel lock poisoned") = Some(hook);
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    fn record_error(&self, err: &Error) {
        if matches!(err, Error::QuotaExceeded(_)) {
            self.quota_error.store(true, Ordering::Relaxed);
        }
        let mut slot = self.error.lock().expect("error lock poisoned");
        if slot.is_none() {
            *slot = Some(err.to_string());
        }
    }

    /// Read up to `len` bytes at `offset`. An empty result means EOF.
    pub async fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::TransferClosed);
        }
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(Error::TransferClosed)?;
        match file {
            TransferFile::Local(f) => {
                f.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                let mut read = 0usize;
                while read < buf.len() {
                    let n = f.read(&mut buf[read..]).await?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                buf.truncate(read);
                self.bytes_sent.fetch_add(read as u64, Ordering::Relaxed);
                self.touch();
                Ok(buf)
            }
            TransferFile::Pipe { .. } => Err(Error::OpUnsupported("read from pipe".to_string())),
        }
    }

    /// Write `data` at `offset`, enforcing the resume watermark and the
    /// quota headroom
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::TransferClosed);
        }
        if offset < self.min_write_offset {
            let err = Error::InvalidOffset {
                requested: offset,
                min: self.min_write_offset,
            };
            self.record_error(&err);
            return Err(err);
        }
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(Error::TransferClosed)?;
        match file {
            TransferFile::Local(f) => {
                // resumed uploads rename the partial target into the
                // staging file first, so offsets always match the file
                f.seek(std::io::SeekFrom::Start(offset)).await?;
                f.write_all(data).await?;
            }
            TransferFile::Pipe { writer, .. } => {
                let expected = self.bytes_received.load(Ordering::Relaxed) + self.min_write_offset;
                if offset != expected {
                    let err = Error::OpUnsupported(format!(
                        "non-sequential write at {} on a pipe backend",
                        offset
                    ));
                    self.record_error(&err);
                    return Err(err);
                }
                writer.write_all(data).await?;
            }
        }
        let received = self
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed)
            + data.len() as u64;
        self.touch();
        if self.max_write_size > 0 && received as i64 > self.max_write_size {
            let err = Error::QuotaExceeded(format!(
                "upload of {} exceeds the remaining quota",
                self.virtual_path
            ));
            self.record_error(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Terminal state transition. The first call settles staging files
    /// and quota and reports the outcome; later calls are no-ops.
    /// Returns the final size of the target file.
    pub async fn close(&self, err: Option<Error>) -> Result<i64> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(self.final_size().await);
        }

        let file = self.file.lock().await.take();
        let mut close_err: Option<Error> = err;
        if close_err.is_none() {
            if let Some(msg) = self.error.lock().expect("error lock poisoned").clone() {
                close_err = Some(if self.quota_error.load(Ordering::Relaxed) {
                    Error::QuotaExceeded(msg)
                } else {
                    Error::Generic(msg)
                });
            }
        }

        match file {
            Some(TransferFile::Local(mut f)) => {
                if let Err(e) = f.flush().await {
                    close_err.get_or_insert(Error::Io(e));
                }
            }
            Some(TransferFile::Pipe { mut writer, done }) => {
                let _ = writer.shutdown().await;
                drop(writer);
                match done.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        close_err.get_or_insert(Error::Io(e));
                    }
                    Err(_) => {
                        close_err
                            .get_or_insert(Error::Connection("uploader vanished".to_string()));
                    }
                }
            }
            None => {}
        }

        if self.transfer_type == TransferType::Download {
            return match close_err {
                None => Ok(self.bytes_sent() as i64),
                Some(e) => Err(e),
            };
        }

        match &close_err {
            None => {
                if let Some(staging) = &self.staging_path {
                    if let Err(e) = fs::rename(staging, &self.host_path).await {
                        warn!(
                            staging = %staging.display(),
                            target = %self.host_path.display(),
                            error = %e,
                            "atomic rename failed"
                        );
                        return Err(Error::Io(e));
                    }
                }
                let final_size = self.final_size().await;
                let size_delta = final_size - self.initial_size as i64;
                let files_delta = if self.is_new_file { 1 } else { 0 };
                self.charge_quota(files_delta, size_delta).await;
                Ok(final_size)
            }
            Some(_) => {
                self.fire_cancel_hook();
                if let Some(staging) = &self.staging_path {
                    match self.mode {
                        UploadMode::Atomic => {
                            if let Err(e) = fs::remove_file(staging).await {
                                debug!(path = %staging.display(), error = %e, "staging cleanup failed");
                            }
                        }
                        UploadMode::AtomicResume => {
                            // keep the received bytes for a later resume
                            if let Err(e) = fs::rename(staging, &self.host_path).await {
                                warn!(path = %staging.display(), error = %e, "resume rename failed");
                            }
                        }
                        UploadMode::Standard => {}
                    }
                }
                Err(close_err.expect("checked above"))
            }
        }
    }

    fn fire_cancel_hook(&self) {
        if let Some(hook) = self.cancel.lock().expect("cancel lock poisoned").take() {
            hook();
        }
    }

    async fn final_size(&self) -> i64 {
        match fs::metadata(&self.host_path).await {
            Ok(m) => m.len() as i64,
            Err(_) => self.bytes_received.load(Ordering::Relaxed) as i64,
        }
    }

    /// Charge the close-time quota delta to the user and, when the path
    /// lives inside a virtual folder, to the folder (and through it to
    /// the user when the folder is included in the user quota)
    async fn charge_quota(&self, files_delta: i64, size_delta: i64) {
        if files_delta == 0 && size_delta == 0 {
            return;
        }
        match self.provider.quota_tracking() {
            QuotaTracking::Off => return,
            QuotaTracking::RestrictionsOnly if !self.user.has_quota_restrictions() => return,
            _ => {}
        }
        if let Some(folder) = self.user.virtual_folder_for_path(&self.virtual_path) {
            if let Err(e) = self
                .provider
                .update_folder_quota(&folder.name, files_delta, size_delta, false)
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
            .update_user_quota(&self.user.username, files_delta, size_delta, false)
            .await
        {
            warn!(username = %self.user.username, error = %e, "user quota update failed");
        }
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("type", &self.transfer_type)
            .field("path", &self.virtual_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use tidegate_core::Permission;
    use tidegate_provider::MemoryProvider;

    async fn make_provider(username: &str, quota_files: i64, quota_size: i64) -> Arc<MemoryProvider> {
        use tidegate_provider::memory::StoredUser;
        let provider = Arc::new(MemoryProvider::new(QuotaTracking::Full));
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        provider
            .add_user(StoredUser {
                user: User {
                    username: username.to_string(),
                    home_dir: PathBuf::from("/srv").join(username),
                    status: Default::default(),
                    expiration_date: 0,
                    permissions,
                    filters: Default::default(),
                    quota_files,
                    quota_size,
                    max_sessions: 0,
                    used_quota_files: 0,
                    used_quota_size: 0,
                    last_login: None,
                    fs_config: Default::default(),
                    virtual_folders: Vec::new(),
                },
                password: String::new(),
                public_keys: Vec::new(),
            })
            .await
            .unwrap();
        provider
    }

    async fn snapshot(provider: &Arc<MemoryProvider>, username: &str) -> Arc<User> {
        Arc::new(provider.user_exists(username).await.unwrap())
    }

    async fn open_local(path: &Path) -> TransferFile {
        TransferFile::Local(
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .await
                .unwrap(),
        )
    }

    fn upload_options(mode: UploadMode, is_new: bool) -> UploadOptions {
        UploadOptions {
            mode,
            is_new_file: is_new,
            initial_size: 0,
            min_write_offset: 0,
            max_write_size: 0,
        }
    }

    #[tokio::test]
    async fn test_upload_charges_quota() {
        let dir = tempfile::tempdir().unwrap();
        let provider = make_provider("u1", 4, 4096).await;
        let user = snapshot(&provider, "u1").await;
        let target = dir.path().join("a.bin");

        let transfer = Transfer::new_upload(
            "conn1",
            user,
            provider.clone(),
            "/a.bin",
            target.clone(),
            None,
            open_local(&target).await,
            upload_options(UploadMode::Standard, true),
        );
        transfer.write_at(0, &[7u8; 1024]).await.unwrap();
        let size = transfer.close(None).await.unwrap();
        assert_eq!(size, 1024);
        assert_eq!(provider.get_used_quota("u1").await.unwrap(), (1, 1024));
    }

    #[tokio::test]
    async fn test_failed_upload_charges_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let provider = make_provider("u1", 4, 4096).await;
        let user = snapshot(&provider, "u1").await;
        let target = dir.path().join("a.bin");

        let transfer = Transfer::new_upload(
            "conn1",
            user,
            provider.clone(),
            "/a.bin",
            target.clone(),
            None,
            open_local(&target).await,
            upload_options(UploadMode::Standard, true),
        );
        transfer.write_at(0, &[7u8; 100]).await.unwrap();
        let res = transfer
            .close(Some(Error::Connection("channel dropped".into())))
            .await;
        assert!(res.is_err());
        assert_eq!(provider.get_used_quota("u1").await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_quota_headroom_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let provider = make_provider("u1", 4, 4096).await;
        let user = snapshot(&provider, "u1").await;
        let target = dir.path().join("big.bin");

        let mut options = upload_options(UploadMode::Standard, true);
        options.max_write_size = 4096;
        let transfer = Transfer::new_upload(
            "conn1",
            user,
            provider.clone(),
            "/big.bin",
            target.clone(),
            None,
            open_local(&target).await,
            options,
        );
        transfer.write_at(0, &[0u8; 4096]).await.unwrap();
        let err = transfer.write_at(4096, &[0u8; 1000]).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
        let close = transfer.close(None).await;
        assert!(matches!(close, Err(Error::QuotaExceeded(_))));
        assert_eq!(provider.get_used_quota("u1").await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_invalid_resume_offset() {
        let dir = tempfile::tempdir().unwrap();
        let provider = make_provider("u1", 0, 0).await;
        let user = snapshot(&provider, "u1").await;
        let target = dir.path().join("resume.bin");

        let mut options = upload_options(UploadMode::Standard, false);
        options.min_write_offset = 10;
        let transfer = Transfer::new_upload(
            "conn1",
            user,
            provider,
            "/resume.bin",
            target.clone(),
            None,
            open_local(&target).await,
            options,
        );
        let err = transfer.write_at(0, b"xxxx").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOffset { requested: 0, min: 10 }));
    }

    #[tokio::test]
    async fn test_atomic_failure_preserves_target() {
        let dir = tempfile::tempdir().unwrap();
        let provider = make_provider("u1", 0, 0).await;
        let user = snapshot(&provider, "u1").await;
        let target = dir.path().join("doc.txt");
        let staging = dir.path().join("doc.txt.tmp.1");
        fs::write(&target, b"original").await.unwrap();

        let transfer = Transfer::new_upload(
            "conn1",
            user,
            provider,
            "/doc.txt",
            target.clone(),
            Some(staging.clone()),
            open_local(&staging).await,
            upload_options(UploadMode::Atomic, false),
        );
        transfer.write_at(0, b"partial").await.unwrap();
        let res = transfer.close(Some(Error::Connection("lost".into()))).await;
        assert!(res.is_err());
        assert_eq!(fs::read(&target).await.unwrap(), b"original");
        assert!(fs::metadata(&staging).await.is_err());
    }

    #[tokio::test]
    async fn test_atomic_success_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let provider = make_provider("u1", 0, 0).await;
        let user = snapshot(&provider, "u1").await;
        let target = dir.path().join("doc.txt");
        let staging = dir.path().join("doc.txt.tmp.2");
        fs::write(&target, b"original").await.unwrap();

        let mut options = upload_options(UploadMode::Atomic, false);
        options.initial_size = 8;
        let transfer = Transfer::new_upload(
            "conn1",
            user,
            provider,
            "/doc.txt",
            target.clone(),
            Some(staging.clone()),
            open_local(&staging).await,
            options,
        );
        transfer.write_at(0, b"replaced contents").await.unwrap();
        transfer.close(None).await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"replaced contents");
    }

    #[tokio::test]
    async fn test_atomic_resume_keeps_partial_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = make_provider("u1", 0, 0).await;
        let user = snapshot(&provider, "u1").await;
        let target = dir.path().join("big.bin");
        let staging = dir.path().join("big.bin.tmp.3");

        let transfer = Transfer::new_upload(
            "conn1",
            user,
            provider,
            "/big.bin",
            target.clone(),
            Some(staging.clone()),
            open_local(&staging).await,
            upload_options(UploadMode::AtomicResume, true),
        );
        transfer.write_at(0, b"received-so-far").await.unwrap();
        let res = transfer.close(Some(Error::Connection("cut".into()))).await;
        assert!(res.is_err());
        assert_eq!(fs::read(&target).await.unwrap(), b"received-so-far");
    }

    #[tokio::test]
    async fn test_close_is_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let provider = make_provider("u1", 0, 0).await;
        let user = snapshot(&provider, "u1").await;
        let target = dir.path().join("x.bin");

        let transfer = Transfer::new_upload(
            "conn1",
            user,
            provider,
            "/x.bin",
            target.clone(),
            None,
            open_local(&target).await,
            upload_options(UploadMode::Standard, true),
        );
        transfer.write_at(0, b"abc").await.unwrap();
        let first = transfer.close(Some(Error::Generic("boom".into()))).await;
        assert!(first.is_err());
        // the error is reported once, later closes succeed quietly
        assert!(transfer.close(None).await.is_ok());
        assert!(matches!(
            transfer.write_at(3, b"more").await,
            Err(Error::TransferClosed)
        ));
        assert!(matches!(
            transfer.read_at(0, 1).await,
            Err(Error::TransferClosed)
        ));
    }

    #[tokio::test]
    async fn test_download_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = make_provider("u1", 0, 0).await;
        let user = snapshot(&provider, "u1").await;
        let source = dir.path().join("data.bin");
        fs::write(&source, b"0123456789").await.unwrap();

        let transfer = Transfer::new_download(
            "conn1",
            user,
            provider.clone(),
            "/data.bin",
            source.clone(),
            TransferFile::Local(fs::File::open(&source).await.unwrap()),
        );
        let chunk = transfer.read_at(2, 4).await.unwrap();
        assert_eq!(&chunk, b"2345");
        let eof = transfer.read_at(10, 4).await.unwrap();
        assert!(eof.is_empty());
        assert_eq!(transfer.bytes_sent(), 4);
        transfer.close(None).await.unwrap();
        // downloads never touch quota
        assert_eq!(provider.get_used_quota("u1").await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_pipe_upload_reports_consumer_error() {
        let provider = make_provider("u1", 0, 0).await;
        let user = snapshot(&provider, "u1").await;
        let (tx, rx) = oneshot::channel();
        let (writer, mut reader) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut sink = Vec::new();
            let res = reader.read_to_end(&mut sink).await.map(|_| ());
            let _ = tx.send(res.and(Err(std::io::Error::other("backend rejected object"))));
        });

        let transfer = Transfer::new_upload(
            "conn1",
            user,
            provider,
            "/remote.bin",
            PathBuf::from("/nonexistent/remote.bin"),
            None,
            TransferFile::Pipe {
                writer: Box::new(writer),
                done: rx,
            },
            upload_options(UploadMode::Standard, true),
        );
        transfer.write_at(0, b"payload").await.unwrap();
        // sequential-only: a gap is refused
        assert!(transfer.write_at(100, b"x").await.is_err());
        let res = transfer.close(None).await;
        assert!(res.is_err());
    }
}
