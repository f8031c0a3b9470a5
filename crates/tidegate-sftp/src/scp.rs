//! SCP sub-protocol.
//!
//! Implements the informal SCP "sink" (`-t`, upload to server) and
//! "source" (`-f`, download from server) modes inside an SSH exec
//! channel. Control messages:
//!
//! - `Cmmmm size name\n` file entry, followed by `size` bytes and an ack
//! - `Dmmmm 0 name\n` / `E\n` begin/end directory (recursive mode)
//! - `Tmtime 0 atime 0\n` times to apply to the next entry (`-p`)
//! - `\0` ack, `\x01` warning, `\x02` fatal error + message + `\n`
//!
//! Permissions and quota are enforced on every created entry, and every
//! file moves through a [`Transfer`] so SCP activity is visible to the
//! registry and the idle sweeper.

use russh::server::Handle;
use russh::ChannelId;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::actions::ActionsConfig;
use crate::config::UploadMode;
use crate::error::{Error, Result};
use crate::handler::{begin_upload, finish_transfer, ChannelInput, UploadRequest};
use crate::registry::ConnectionRegistry;
use crate::session::ServerSession;
use crate::transfer::{Transfer, TransferFile};
use tidegate_core::{clean_virtual_path, Permission};
use tidegate_provider::DataProvider;

const ACK: u8 = 0x00;
const WARNING: u8 = 0x01;
const FATAL: u8 = 0x02;

/// Transfer chunk size in both directions
const CHUNK_SIZE: usize = 32 * 1024;

/// Upper bound on one control line
const MAX_MESSAGE_LEN: usize = 2048;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Parsed `scp` command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpCommand {
    /// `-t`: client pushes to the server
    pub sink: bool,
    /// `-f`: client pulls from the server
    pub source: bool,
    pub recursive: bool,
    pub preserve_times: bool,
    /// `-d`: the target must be a directory
    pub target_is_dir: bool,
    pub path: String,
}

impl ScpCommand {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut cmd = ScpCommand {
            sink: false,
            source: false,
            recursive: false,
            preserve_times: false,
            target_is_dir: false,
            path: String::new(),
        };
        let mut path: Option<String> = None;
        for arg in args {
            match arg.as_str() {
                "-t" => cmd.sink = true,
                "-f" => cmd.source = true,
                "-r" => cmd.recursive = true,
                "-p" => cmd.preserve_times = true,
                "-d" => cmd.target_is_dir = true,
                "-v" | "-q" | "--" => {}
                other if other.starts_with('-') => {
                    // combined flags like -rt
                    for flag in other.chars().skip(1) {
                        match flag {
                            't' => cmd.sink = true,
                            'f' => cmd.source = true,
                            'r' => cmd.recursive = true,
                            'p' => cmd.preserve_times = true,
                            'd' => cmd.target_is_dir = true,
                            'v' | 'q' => {}
                            _ => {
                                return Err(Error::Protocol(format!(
                                    "unsupported scp option {}",
                                    other
                                )))
                            }
                        }
                    }
                }
                other => path = Some(other.to_string()),
            }
        }
        if cmd.sink == cmd.source {
            return Err(Error::Protocol(
                "scp needs exactly one of -t and -f".to_string(),
            ));
        }
        cmd.path = clean_virtual_path(&path.ok_or_else(|| {
            Error::Protocol("scp command is missing the target path".to_string())
        })?);
        Ok(cmd)
    }
}

/// Four octal digits including setuid/setgid/sticky
pub fn file_mode_string(mode: u32) -> String {
    format!("{:04o}", mode & 0o7777)
}

pub fn parse_file_mode(s: &str) -> Result<u32> {
    if s.len() != 4 {
        return Err(Error::Protocol(format!("invalid file mode {}", s)));
    }
    u32::from_str_radix(s, 8).map_err(|_| Error::Protocol(format!("invalid file mode {}", s)))
}

/// Parse `mmmm size name` (the `C`/`D` type byte is already consumed)
pub fn parse_upload_message(line: &str) -> Result<(u32, u64, String)> {
    let mut parts = line.splitn(3, ' ');
    let mode = parse_file_mode(parts.next().unwrap_or(""))?;
    let size: u64 = parts
        .next()
        .ok_or_else(|| Error::Protocol(format!("invalid scp message {}", line)))?
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid size in scp message {}", line)))?;
    let name = parts
        .next()
        .filter(|n| !n.is_empty() && !n.contains('/'))
        .ok_or_else(|| Error::Protocol(format!("invalid name in scp message {}", line)))?;
    Ok((mode, size, name.to_string()))
}

/// Parse `Tmtime 0 atime 0`
pub fn parse_time_message(line: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() != 4 {
        return Err(Error::Protocol(format!("invalid time message {}", line)));
    }
    let mtime = parts[0]
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid mtime {}", parts[0])))?;
    let atime = parts[2]
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid atime {}", parts[2])))?;
    Ok((mtime, atime))
}

/// Buffered view over the channel input
struct ScpStream {
    rx: mpsc::Receiver<ChannelInput>,
    buf: VecDeque<u8>,
    eof: bool,
}

impl ScpStream {
    fn new(rx: mpsc::Receiver<ChannelInput>) -> Self {
        Self {
            rx,
            buf: VecDeque::new(),
            eof: false,
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if self.eof {
            return Err(Error::Connection("unexpected end of scp stream".to_string()));
        }
        match self.rx.recv().await {
            Some(ChannelInput::Data(data)) => {
                self.buf.extend(data);
                Ok(())
            }
            Some(ChannelInput::Eof) | None => {
                self.eof = true;
                Err(Error::Connection("unexpected end of scp stream".to_string()))
            }
        }
    }

    async fn read_byte(&mut self) -> Result<u8> {
        while self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(self.buf.pop_front().expect("buffer checked non-empty"))
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let b = self.read_byte().await?;
            if b == b'\n' {
                break;
            }
            line.push(b);
            if line.len() > MAX_MESSAGE_LEN {
                return Err(Error::Protocol("scp control message too long".to_string()));
            }
        }
        String::from_utf8(line).map_err(|_| Error::Protocol("invalid scp message".to_string()))
    }

    async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>> {
        while self.buf.is_empty() {
            self.fill().await?;
        }
        let take = max.min(self.buf.len());
        Ok(self.buf.drain(..take).collect())
    }

    /// Consume the receiver's ack after a sent entry
    async fn read_ack(&mut self) -> Result<()> {
        match self.read_byte().await? {
            ACK => Ok(()),
            WARNING => {
                let msg = self.read_line().await.unwrap_or_default();
                warn!(msg, "scp peer warning");
                Ok(())
            }
            FATAL => {
                let msg = self.read_line().await.unwrap_or_default();
                Err(Error::Generic(format!("scp peer error: {}", msg)))
            }
            other => Err(Error::Protocol(format!("invalid ack byte {:#04x}", other))),
        }
    }
}

pub struct ScpEngine {
    session: Arc<ServerSession>,
    registry: Arc<ConnectionRegistry>,
    provider: Arc<dyn DataProvider>,
    actions: ActionsConfig,
    upload_mode: UploadMode,
    handle: Handle,
    channel: ChannelId,
    cmd: ScpCommand,
}

impl ScpEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<ServerSession>,
        registry: Arc<ConnectionRegistry>,
        provider: Arc<dyn DataProvider>,
        actions: ActionsConfig,
        upload_mode: UploadMode,
        handle: Handle,
        channel: ChannelId,
        cmd: ScpCommand,
    ) -> Self {
        Self {
            session,
            registry,
            provider,
            actions,
            upload_mode,
            handle,
            channel,
            cmd,
        }
    }

    pub async fn run(self, rx: mpsc::Receiver<ChannelInput>) {
        let mut stream = ScpStream::new(rx);
        let result = if self.cmd.sink {
            self.run_sink(&mut stream).await
        } else {
            self.run_source(&mut stream).await
        };
        let exit_status = match &result {
            Ok(()) => 0,
            Err(e) => {
                warn!(
                    connection_id = %self.session.id(),
                    error = %e,
                    "scp command failed"
                );
                let _ = self.send_fatal(&e.sanitized_message()).await;
                1
            }
        };
        let _ = self.handle.exit_status_request(self.channel, exit_status).await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
        debug!(connection_id = %self.session.id(), exit_status, "scp channel closed");
    }

    async fn send_bytes(&self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel, russh::CryptoVec::from_slice(data))
            .await
            .map_err(|_| Error::Connection("channel write failed".to_string()))
    }

    async fn send_ack(&self) -> Result<()> {
        self.send_bytes(&[ACK]).await
    }

    async fn send_fatal(&self, msg: &str) -> Result<()> {
        let mut out = Vec::with_capacity(msg.len() + 2);
        out.push(FATAL);
        out.extend_from_slice(msg.as_bytes());
        out.push(b'\n');
        self.send_bytes(&out).await
    }

    // ----- sink (upload to the server) -----

    async fn run_sink(&self, stream: &mut ScpStream) -> Result<()> {
        self.send_ack().await?;
        // the destination directory stack; an empty stack means the
        // target names the file itself
        let mut dir_stack: Vec<String> = Vec::new();
        let base = self.cmd.path.clone();
        let base_is_dir = self.cmd.target_is_dir
            || matches!(self.session.fs().stat(&base).await, Ok(m) if m.is_dir());
        if self.cmd.recursive && !base_is_dir {
            self.ensure_dir(&base, DEFAULT_DIR_MODE).await?;
        }
        if base_is_dir || self.cmd.recursive {
            dir_stack.push(base.clone());
        }
        let mut pending_times: Option<(u32, u32)> = None;

        loop {
            let first = match stream.read_byte().await {
                Ok(b) => b,
                // a clean EOF between messages ends the upload
                Err(_) => break,
            };
            match first {
                b'T' => {
                    let line = stream.read_line().await?;
                    pending_times = Some(parse_time_message(&line)?);
                    self.send_ack().await?;
                }
                b'C' => {
                    let line = stream.read_line().await?;
                    let (mode, size, name) = parse_upload_message(&line)?;
                    let target = match dir_stack.last() {
                        Some(dir) => join_virtual(dir, &name),
                        None => base.clone(),
                    };
                    self.receive_file(stream, &target, mode, size, pending_times.take())
                        .await?;
                }
                b'D' => {
                    if !self.cmd.recursive {
                        return Err(Error::Protocol(
                            "directory message without recursive mode".to_string(),
                        ));
                    }
                    let line = stream.read_line().await?;
                    let (mode, _, name) = parse_upload_message(&line)?;
                    let parent = dir_stack
                        .last()
                        .cloned()
                        .unwrap_or_else(|| base.clone());
                    let target = join_virtual(&parent, &name);
                    self.ensure_dir(&target, mode).await?;
                    if let Some((mtime, atime)) = pending_times.take() {
                        let _ = self.session.fs().set_times(&target, atime, mtime).await;
                    }
                    dir_stack.push(target);
                    self.send_ack().await?;
                }
                b'E' => {
                    let _ = stream.read_line().await?;
                    if dir_stack.pop().is_none() {
                        return Err(Error::Protocol("unbalanced directory end".to_string()));
                    }
                    self.send_ack().await?;
                }
                ACK => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected scp message type {:#04x}",
                        other
                    )));
                }
            }
        }
        Ok(())
    }

    async fn ensure_dir(&self, vpath: &str, _mode: u32) -> Result<()> {
        let fs = self.session.fs();
        match fs.stat(vpath).await {
            Ok(m) if m.is_dir() => Ok(()),
            Ok(_) => Err(Error::Generic(format!("{} is not a directory", vpath))),
            Err(Error::NotFound(_)) => {
                if !self.session.user().has_perm(Permission::CreateDirs, vpath) {
                    return Err(Error::PermissionDenied(vpath.to_string()));
                }
                fs.mkdir(vpath).await
            }
            Err(e) => Err(e),
        }
    }

    async fn receive_file(
        &self,
        stream: &mut ScpStream,
        vpath: &str,
        mode: u32,
        size: u64,
        times: Option<(u32, u32)>,
    ) -> Result<()> {
        let transfer = begin_upload(
            &self.session,
            &self.registry,
            &self.provider,
            self.upload_mode,
            UploadRequest {
                vpath: vpath.to_string(),
                truncate: true,
                resume: false,
                exclusive: false,
            },
        )
        .await?;
        self.send_ack().await?;

        let mut offset = 0u64;
        let mut failure: Option<Error> = None;
        while offset < size {
            let want = ((size - offset) as usize).min(CHUNK_SIZE);
            let chunk = match stream.read_chunk(want).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if let Err(e) = transfer.write_at(offset, &chunk).await {
                failure = Some(e);
                break;
            }
            offset += chunk.len() as u64;
        }

        if failure.is_none() {
            // the single ack byte following the payload
            if let Err(e) = stream.read_ack().await {
                failure = Some(e);
            }
        }

        let result = transfer.close(failure).await;
        finish_transfer(&self.session, &self.registry, &self.actions, &transfer, &result).await;
        let size_written = result?;

        let fs = self.session.fs();
        let _ = fs.set_permissions(vpath, mode).await;
        if let Some((mtime, atime)) = times {
            let _ = fs.set_times(vpath, atime, mtime).await;
        }
        info!(
            connection_id = %self.session.id(),
            path = vpath,
            size = size_written,
            "scp upload completed"
        );
        self.send_ack().await
    }

    // ----- source (download from the server) -----

    async fn run_source(&self, stream: &mut ScpStream) -> Result<()> {
        stream.read_ack().await?;
        let metadata = self.session.fs().stat(&self.cmd.path).await?;
        if metadata.is_dir() {
            if !self.cmd.recursive {
                return Err(Error::Generic(format!(
                    "{} is not a regular file",
                    self.cmd.path
                )));
            }
            self.send_dir(stream, &self.cmd.path).await
        } else {
            self.send_file(stream, &self.cmd.path, &metadata).await
        }
    }

    fn entry_name(vpath: &str) -> String {
        vpath.rsplit('/').next().unwrap_or("").to_string()
    }

    async fn send_times(
        &self,
        stream: &mut ScpStream,
        metadata: &std::fs::Metadata,
    ) -> Result<()> {
        let to_unix = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0)
        };
        let message = format!(
            "T{} 0 {} 0\n",
            to_unix(metadata.modified()),
            to_unix(metadata.accessed())
        );
        self.send_bytes(message.as_bytes()).await?;
        stream.read_ack().await
    }

    async fn send_file(
        &self,
        stream: &mut ScpStream,
        vpath: &str,
        metadata: &std::fs::Metadata,
    ) -> Result<()> {
        let user = self.session.user();
        if !user.has_perm(Permission::Download, vpath) || !user.is_file_allowed(vpath) {
            return Err(Error::PermissionDenied(vpath.to_string()));
        }
        if self.cmd.preserve_times {
            self.send_times(stream, metadata).await?;
        }
        let mode = unix_mode(metadata).unwrap_or(DEFAULT_FILE_MODE);
        let header = format!(
            "C{} {} {}\n",
            file_mode_string(mode),
            metadata.len(),
            Self::entry_name(vpath)
        );
        self.send_bytes(header.as_bytes()).await?;
        stream.read_ack().await?;

        let fs = self.session.fs();
        let host = fs.resolve(vpath)?;
        let file = fs.open_read(vpath).await?;
        let transfer = Transfer::new_download(
            self.session.id(),
            user.clone(),
            self.provider.clone(),
            vpath,
            host,
            TransferFile::Local(file),
        );
        self.registry.add_transfer(transfer.clone());

        let mut offset = 0u64;
        let mut failure: Option<Error> = None;
        loop {
            match transfer.read_at(offset, CHUNK_SIZE as u32).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => {
                    offset += chunk.len() as u64;
                    if let Err(e) = self.send_bytes(&chunk).await {
                        failure = Some(e);
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let result = transfer.close(failure).await;
        finish_transfer(&self.session, &self.registry, &self.actions, &transfer, &result).await;
        result?;

        self.send_ack().await?;
        stream.read_ack().await
    }

    fn send_dir<'a>(
        &'a self,
        stream: &'a mut ScpStream,
        vpath: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let user = self.session.user();
            if !user.has_perm(Permission::List, vpath) {
                return Err(Error::PermissionDenied(vpath.to_string()));
            }
            let metadata = self.session.fs().stat(vpath).await?;
            if self.cmd.preserve_times {
                self.send_times(stream, &metadata).await?;
            }
            let mode = unix_mode(&metadata).unwrap_or(DEFAULT_DIR_MODE);
            let header = format!(
                "D{} 0 {}\n",
                file_mode_string(mode),
                Self::entry_name(vpath)
            );
            self.send_bytes(header.as_bytes()).await?;
            stream.read_ack().await?;

            let entries = self.session.fs().read_dir(vpath).await?;
            for (name, attrs) in entries {
                let child = join_virtual(vpath, &name);
                if attrs.is_dir() {
                    self.send_dir(stream, &child).await?;
                } else if !attrs.is_symlink() {
                    let child_meta = self.session.fs().stat(&child).await?;
                    self.send_file(stream, &child, &child_meta).await?;
                }
            }

            self.send_bytes(b"E\n").await?;
            stream.read_ack().await
        })
    }
}

fn join_virtual(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

fn unix_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some(metadata.mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_command() {
        let cmd = ScpCommand::parse(&args(&["-t", "/tmp/in"])).unwrap();
        assert!(cmd.sink);
        assert!(!cmd.source);
        assert_eq!(cmd.path, "/tmp/in");

        let cmd = ScpCommand::parse(&args(&["-r", "-p", "-f", "/data"])).unwrap();
        assert!(cmd.source && cmd.recursive && cmd.preserve_times);

        let cmd = ScpCommand::parse(&args(&["-rt", "/up"])).unwrap();
        assert!(cmd.sink && cmd.recursive);

        // relative targets anchor at the virtual root
        let cmd = ScpCommand::parse(&args(&["-t", "up/sub"])).unwrap();
        assert_eq!(cmd.path, "/up/sub");
    }

    #[test]
    fn test_parse_command_errors() {
        assert!(ScpCommand::parse(&args(&["-t", "-f", "/x"])).is_err());
        assert!(ScpCommand::parse(&args(&["/x"])).is_err());
        assert!(ScpCommand::parse(&args(&["-t"])).is_err());
        assert!(ScpCommand::parse(&args(&["-z", "-t", "/x"])).is_err());
    }

    #[test]
    fn test_file_mode_string() {
        assert_eq!(file_mode_string(0o644), "0644");
        assert_eq!(file_mode_string(0o4700), "4700");
        assert_eq!(file_mode_string(0o2750), "2750");
        assert_eq!(file_mode_string(0o1777), "1777");
        // type bits are masked off
        assert_eq!(file_mode_string(0o100644), "0644");
    }

    #[test]
    fn test_parse_file_mode() {
        assert_eq!(parse_file_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_file_mode("4755").unwrap(), 0o4755);
        assert!(parse_file_mode("644").is_err());
        assert!(parse_file_mode("08aa").is_err());
    }

    #[test]
    fn test_parse_upload_message() {
        let (mode, size, name) = parse_upload_message("0644 4 hello").unwrap();
        assert_eq!(mode, 0o644);
        assert_eq!(size, 4);
        assert_eq!(name, "hello");

        // names may contain spaces
        let (_, size, name) = parse_upload_message("0600 12 with space.txt").unwrap();
        assert_eq!(size, 12);
        assert_eq!(name, "with space.txt");

        assert!(parse_upload_message("invalid").is_err());
        assert!(parse_upload_message("0644 alargefile").is_err());
        assert!(parse_upload_message("0644 1 sub/name").is_err());
        assert!(parse_upload_message("0644 1 ").is_err());
    }

    #[test]
    fn test_parse_time_message() {
        let (mtime, atime) = parse_time_message("1183828267 0 1183828267 0").unwrap();
        assert_eq!(mtime, 1183828267);
        assert_eq!(atime, 1183828267);
        assert!(parse_time_message("1183828267 0").is_err());
        assert!(parse_time_message("a 0 b 0").is_err());
    }

    #[tokio::test]
    async fn test_stream_reads_across_fragments() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = ScpStream::new(rx);
        tx.send(ChannelInput::Data(b"C0644 4 he".to_vec())).await.unwrap();
        tx.send(ChannelInput::Data(b"llo\ndata".to_vec())).await.unwrap();
        assert_eq!(stream.read_byte().await.unwrap(), b'C');
        assert_eq!(stream.read_line().await.unwrap(), "0644 4 hello");
        let chunk = stream.read_chunk(4).await.unwrap();
        assert_eq!(chunk, b"data");
        drop(tx);
        assert!(stream.read_byte().await.is_err());
    }
}
